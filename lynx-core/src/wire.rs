//! Line protocol shared by tracker, tracker-fallback and file-transfer exchanges.
//!
//! Requests are single newline-terminated ASCII lines. Replies are either lines or, for
//! a file, the rest of the stream up to the peer closing it (no length prefix).

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{LynkError, Result};
use crate::lynk::{Peer, SEP};

/// Reply meaning "I do not have that file".
pub const NO: &str = "NO";
/// Acknowledgement sent by our own peer service ahead of a payload.
pub const YES: &str = "YES";

const SWARM_REQUEST: &str = "Swarm_Request:";
const TRACKER_REQUEST: &str = "Tracker_Request:";
const HAVE_FILE: &str = "Do_You_Have_FileName:";

/// Largest payload accepted from a peer (64 MiB).
pub const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;
const MAX_LINE: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Client -> tracker: register me and send the swarm.
    SwarmRequest { ip: String, port: u16, lynk: String },
    /// Client -> peer: where is this lynk's tracker now?
    TrackerRequest { lynk: String },
    /// Client -> peer: send me this file.
    HaveFile { lynk: String, file: String },
}

impl Request {
    /// Wire form including the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Request::SwarmRequest { ip, port, lynk } => {
                format!("{SWARM_REQUEST}{ip}:{port}:{lynk}\n")
            }
            Request::TrackerRequest { lynk } => format!("{TRACKER_REQUEST}{lynk}/\n"),
            Request::HaveFile { lynk, file } => format!("{HAVE_FILE}{lynk}/{file}\n"),
        }
    }

    pub fn parse(line: &str) -> Option<Request> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(SWARM_REQUEST) {
            let mut parts = rest.splitn(3, ':');
            let ip = parts.next()?.to_string();
            let port = parts.next()?.parse().ok()?;
            let lynk = parts.next()?.to_string();
            return Some(Request::SwarmRequest { ip, port, lynk });
        }
        if let Some(rest) = line.strip_prefix(TRACKER_REQUEST) {
            let lynk = rest.strip_suffix('/').unwrap_or(rest).to_string();
            return Some(Request::TrackerRequest { lynk });
        }
        if let Some(rest) = line.strip_prefix(HAVE_FILE) {
            let (lynk, file) = rest.split_once('/')?;
            return Some(Request::HaveFile {
                lynk: lynk.to_string(),
                file: file.to_string(),
            });
        }
        None
    }
}

/// Tracker reply line: `<ip>:::<port>`.
pub fn parse_peer_line(line: &str) -> Option<Peer> {
    let (ip, port) = line.trim().split_once(SEP)?;
    if ip.is_empty() {
        return None;
    }
    Some(Peer::new(ip, port.trim().parse().ok()?))
}

pub fn encode_peer_line(peer: &Peer) -> String {
    format!("{}{SEP}{}\n", peer.ip, peer.port)
}

pub async fn connect(addr: &str, limit: Duration) -> Result<TcpStream> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(LynkError::Timeout("connect")),
    }
}

/// One reply line without its terminator, or `None` if the peer closed first.
pub async fn read_line<R>(reader: &mut R, limit: Duration) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut bounded = reader.take(MAX_LINE);
    let n = match timeout(limit, bounded.read_line(&mut line)).await {
        Ok(res) => res?,
        Err(_) => return Err(LynkError::Timeout("read line")),
    };
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Everything left on the stream until the peer closes it, bounded by `limit` and
/// [`MAX_PAYLOAD`].
pub async fn read_to_close<R>(reader: &mut R, limit: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut bounded = reader.take(MAX_PAYLOAD + 1);
    match timeout(limit, bounded.read_to_end(&mut buf)).await {
        Ok(res) => {
            res?;
        }
        Err(_) => return Err(LynkError::Timeout("read payload")),
    }
    if buf.len() as u64 > MAX_PAYLOAD {
        return Err(LynkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "payload exceeds limit",
        )));
    }
    Ok(buf)
}
