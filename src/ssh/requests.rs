//! Translation between `russh`'s typed channel events and opaque
//! [`RequestFrame`]s.
//!
//! `russh` parses the channel requests it knows about and hands them out as
//! [`ChannelMsg`] variants; sending one goes through a dedicated method per
//! request type.  The core only deals in `(type, want_reply, payload)`
//! frames, so both directions go through [`TypedRequest`].  Request types
//! `russh` has no method for cannot be sent and are reported as such.

use russh::{ChannelMsg, Pty, Sig};

use super::channel::RequestFrame;
use crate::wire::{EnvDecodeError, Reader, Writer};

/// Terminal mode opcode that ends the encoded mode list.
const TTY_OP_END: u8 = 0;

// ---------------------------------------------------------------------------
// Typed request
// ---------------------------------------------------------------------------

/// A channel request `russh` can both receive and send.
#[derive(Debug, Clone)]
pub enum TypedRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Env {
        name: String,
        value: String,
    },
    Signal(Sig),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Subsystem(String),
    X11 {
        single_connection: bool,
        protocol: String,
        cookie: String,
        screen: u32,
    },
    AgentForward,
    XonXoff(bool),
    ExitStatus(u32),
    ExitSignal {
        signal: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
}

impl TypedRequest {
    /// Lift a channel event into a request, together with its want-reply
    /// flag.  Data, EOF, close and reply events are not requests.
    pub fn from_msg(msg: ChannelMsg) -> Option<(Self, bool)> {
        let req = match msg {
            ChannelMsg::RequestPty {
                want_reply,
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes,
            } => (
                Self::Pty {
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    modes: terminal_modes_of(&terminal_modes),
                },
                want_reply,
            ),
            ChannelMsg::RequestShell { want_reply } => (Self::Shell, want_reply),
            ChannelMsg::Exec {
                want_reply,
                command,
            } => (Self::Exec(command), want_reply),
            ChannelMsg::SetEnv {
                want_reply,
                variable_name,
                variable_value,
            } => (
                Self::Env {
                    name: variable_name,
                    value: variable_value,
                },
                want_reply,
            ),
            ChannelMsg::Signal { signal } => (Self::Signal(signal), false),
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => (
                Self::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                },
                false,
            ),
            ChannelMsg::RequestSubsystem { want_reply, name } => (Self::Subsystem(name), want_reply),
            ChannelMsg::RequestX11 {
                want_reply,
                single_connection,
                x11_authentication_protocol,
                x11_authentication_cookie,
                x11_screen_number,
            } => (
                Self::X11 {
                    single_connection,
                    protocol: x11_authentication_protocol,
                    cookie: x11_authentication_cookie,
                    screen: x11_screen_number,
                },
                want_reply,
            ),
            ChannelMsg::AgentForward { want_reply } => (Self::AgentForward, want_reply),
            ChannelMsg::XonXoff { client_can_do } => (Self::XonXoff(client_can_do), false),
            ChannelMsg::ExitStatus { exit_status } => (Self::ExitStatus(exit_status), false),
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => (
                Self::ExitSignal {
                    signal: signal_name,
                    core_dumped,
                    error_message,
                    lang_tag,
                },
                false,
            ),
            _ => return None,
        };
        Some(req)
    }

    /// The want-reply flag used when this request is sent on.  `russh` does
    /// not tell a server which flag a client used, so each type gets the one
    /// OpenSSH uses for it; RFC 4254 forbids a reply for the notifications.
    pub fn asks_for_reply(&self) -> bool {
        match self {
            Self::Pty { .. }
            | Self::Shell
            | Self::Exec(_)
            | Self::Subsystem(_)
            | Self::X11 { .. }
            | Self::AgentForward => true,
            Self::Env { .. }
            | Self::Signal(_)
            | Self::WindowChange { .. }
            | Self::XonXoff(_)
            | Self::ExitStatus(_)
            | Self::ExitSignal { .. } => false,
        }
    }

    /// The SSH request type name (RFC 4254 §6).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pty { .. } => "pty-req",
            Self::Shell => "shell",
            Self::Exec(_) => "exec",
            Self::Env { .. } => "env",
            Self::Signal(_) => "signal",
            Self::WindowChange { .. } => "window-change",
            Self::Subsystem(_) => "subsystem",
            Self::X11 { .. } => "x11-req",
            Self::AgentForward => "auth-agent-req@openssh.com",
            Self::XonXoff(_) => "xon-xoff",
            Self::ExitStatus(_) => "exit-status",
            Self::ExitSignal { .. } => "exit-signal",
        }
    }

    /// Encode into wire form.
    pub fn to_frame(&self, want_reply: bool) -> RequestFrame {
        let mut w = Writer::new();
        match self {
            Self::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                let mut encoded_modes = Writer::new();
                for (opcode, value) in modes {
                    encoded_modes.put_u8(*opcode as u8).put_u32(*value);
                }
                encoded_modes.put_u8(TTY_OP_END);
                w.put_string(term.as_bytes())
                    .put_u32(*col_width)
                    .put_u32(*row_height)
                    .put_u32(*pix_width)
                    .put_u32(*pix_height)
                    .put_string(&encoded_modes.finish());
            }
            Self::Shell | Self::AgentForward => {}
            Self::Exec(command) => {
                w.put_string(command);
            }
            Self::Env { name, value } => {
                w.put_string(name.as_bytes()).put_string(value.as_bytes());
            }
            Self::Signal(sig) => {
                w.put_string(sig_name(sig).as_bytes());
            }
            Self::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                w.put_u32(*col_width)
                    .put_u32(*row_height)
                    .put_u32(*pix_width)
                    .put_u32(*pix_height);
            }
            Self::Subsystem(name) => {
                w.put_string(name.as_bytes());
            }
            Self::X11 {
                single_connection,
                protocol,
                cookie,
                screen,
            } => {
                w.put_bool(*single_connection)
                    .put_string(protocol.as_bytes())
                    .put_string(cookie.as_bytes())
                    .put_u32(*screen);
            }
            Self::XonXoff(client_can_do) => {
                w.put_bool(*client_can_do);
            }
            Self::ExitStatus(code) => {
                w.put_u32(*code);
            }
            Self::ExitSignal {
                signal,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                w.put_string(sig_name(signal).as_bytes())
                    .put_bool(*core_dumped)
                    .put_string(error_message.as_bytes())
                    .put_string(lang_tag.as_bytes());
            }
        }
        RequestFrame::new(self.kind(), want_reply, w.finish())
    }

    /// Parse a frame back into a typed request.  `Ok(None)` means the type
    /// is one `russh` cannot send.
    pub fn from_frame(frame: &RequestFrame) -> Result<Option<Self>, EnvDecodeError> {
        let mut r = Reader::new(&frame.payload);
        let req = match frame.kind.as_str() {
            "pty-req" => {
                let term = r.utf8()?.to_string();
                let col_width = r.u32()?;
                let row_height = r.u32()?;
                let pix_width = r.u32()?;
                let pix_height = r.u32()?;
                let modes = decode_modes(r.string()?)?;
                Self::Pty {
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    modes,
                }
            }
            "shell" => Self::Shell,
            "exec" => Self::Exec(r.string()?.to_vec()),
            "env" => {
                let name = r.utf8()?.to_string();
                let value = r.utf8()?.to_string();
                Self::Env { name, value }
            }
            "signal" => Self::Signal(sig_from_name(r.utf8()?)),
            "window-change" => Self::WindowChange {
                col_width: r.u32()?,
                row_height: r.u32()?,
                pix_width: r.u32()?,
                pix_height: r.u32()?,
            },
            "subsystem" => Self::Subsystem(r.utf8()?.to_string()),
            "x11-req" => Self::X11 {
                single_connection: r.bool()?,
                protocol: r.utf8()?.to_string(),
                cookie: r.utf8()?.to_string(),
                screen: r.u32()?,
            },
            "auth-agent-req@openssh.com" => Self::AgentForward,
            "xon-xoff" => Self::XonXoff(r.bool()?),
            "exit-status" => Self::ExitStatus(r.u32()?),
            "exit-signal" => Self::ExitSignal {
                signal: sig_from_name(r.utf8()?),
                core_dumped: r.bool()?,
                error_message: r.utf8()?.to_string(),
                lang_tag: r.utf8()?.to_string(),
            },
            _ => return Ok(None),
        };
        r.finish()?;
        Ok(Some(req))
    }
}

/// Drop the `TTY_OP_END` entries `russh` uses to pad decoded mode lists and
/// to stand in for opcodes it does not know.
pub fn terminal_modes_of(modes: &[(Pty, u32)]) -> Vec<(Pty, u32)> {
    modes
        .iter()
        .filter(|(mode, _)| *mode != Pty::TTY_OP_END)
        .copied()
        .collect()
}

/// Decode an encoded terminal-modes string.  Opcodes `russh` does not know
/// are skipped; parsing stops at `TTY_OP_END`.
fn decode_modes(raw: &[u8]) -> Result<Vec<(Pty, u32)>, EnvDecodeError> {
    let mut r = Reader::new(raw);
    let mut modes = Vec::new();
    while r.remaining() > 0 {
        let opcode = r.u8()?;
        if opcode == TTY_OP_END {
            break;
        }
        // Opcodes 160 and above have no defined argument size (RFC 4254 §8).
        if opcode >= 160 {
            break;
        }
        let value = r.u32()?;
        if let Some(mode) = Pty::from_u8(opcode) {
            modes.push((mode, value));
        }
    }
    Ok(modes)
}

// ---------------------------------------------------------------------------
// Signal names
// ---------------------------------------------------------------------------

/// RFC 4254 §6.10 signal name, without the `SIG` prefix.
pub fn sig_name(sig: &Sig) -> &str {
    match sig {
        Sig::ABRT => "ABRT",
        Sig::ALRM => "ALRM",
        Sig::FPE => "FPE",
        Sig::HUP => "HUP",
        Sig::ILL => "ILL",
        Sig::INT => "INT",
        Sig::KILL => "KILL",
        Sig::PIPE => "PIPE",
        Sig::QUIT => "QUIT",
        Sig::SEGV => "SEGV",
        Sig::TERM => "TERM",
        Sig::USR1 => "USR1",
        Sig::Custom(name) => name,
    }
}

pub fn sig_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
