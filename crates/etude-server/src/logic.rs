//! Demo business handlers: heartbeat, register and login.
//!
//! Request bodies are packed, fixed-size records; strings are NUL-padded.
//! Register and login answer with the request code and a 4-byte big-endian
//! status.

use etude_core::{Dispatcher, PacketHeader, Session};
use tracing::{debug, info, warn};

pub const CMD_PING: u16 = 0;
pub const CMD_REGISTER: u16 = 5;
pub const CMD_LOGIN: u16 = 6;

const USERNAME_LEN: usize = 56;
const PASSWORD_LEN: usize = 40;
pub const REGISTER_LEN: usize = 4 + USERNAME_LEN + PASSWORD_LEN;
pub const LOGIN_LEN: usize = USERNAME_LEN + PASSWORD_LEN;

pub const STATUS_OK: i32 = 0;
pub const STATUS_REJECTED: i32 = 1;

pub fn dispatcher() -> Dispatcher {
    Dispatcher::builder()
        .route(CMD_PING, handle_ping)
        .route(CMD_REGISTER, handle_register)
        .route(CMD_LOGIN, handle_login)
        .build()
}

fn handle_ping(session: &Session<'_>, _header: &PacketHeader, body: &[u8]) -> bool {
    if !body.is_empty() {
        return false;
    }
    session.touch_heartbeat();
    debug!(peer = ?session.peer_addr(), "heartbeat");
    session.reply(CMD_PING, &[]).is_ok()
}

fn handle_register(session: &Session<'_>, header: &PacketHeader, body: &[u8]) -> bool {
    if body.len() != REGISTER_LEN {
        warn!(len = body.len(), "register body has the wrong size");
        return false;
    }
    let kind = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let username = c_string(&body[4..4 + USERNAME_LEN]);
    let status = if username.is_empty() { STATUS_REJECTED } else { STATUS_OK };
    info!(kind, %username, status, "register");
    session.reply(header.message_code, &status.to_be_bytes()).is_ok()
}

fn handle_login(session: &Session<'_>, header: &PacketHeader, body: &[u8]) -> bool {
    if body.len() != LOGIN_LEN {
        warn!(len = body.len(), "login body has the wrong size");
        return false;
    }
    let username = c_string(&body[..USERNAME_LEN]);
    let status = if username.is_empty() { STATUS_REJECTED } else { STATUS_OK };
    info!(%username, status, "login");
    session.reply(header.message_code, &status.to_be_bytes()).is_ok()
}

/// Text up to the first NUL, lossily decoded.
fn c_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
