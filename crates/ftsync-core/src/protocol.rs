//! Command and handshake protocol.
//!
//! Text lines exchanged between the stream-framed transfers:
//!
//! ```text
//! standby -> master   VirtualBox-Fault-Tolerance-Sync-1.0\n
//! master  -> standby  <password bytes, no newline>
//! standby -> master   ACK\n | NACK=<code>[;<message>]\n
//! master  -> standby  <command>\n
//! standby -> master   ACK\n | NACK=<code>[;<message>]\n
//! ```

use crate::error::status;
use crate::transport::Connection;
use crate::{Error, Result};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Welcome banner sent by the standby on accept
pub const WELCOME_BANNER: &[u8] = b"VirtualBox-Fault-Tolerance-Sync-1.0\n";

/// Longest reply line written, newline included
pub const MAX_REPLY_LENGTH: usize = 255;

/// Commands submitted by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Complete state transfer follows on the framed stream
    FullSync,
    /// Dirty-page batch follows
    MemSync,
    /// Incremental VM state checkpoint
    Checkpoint,
    /// Liveness check
    Heartbeat,
}

impl Command {
    /// Wire name of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::FullSync => "full-sync",
            Command::MemSync => "mem-sync",
            Command::Checkpoint => "checkpoint",
            Command::Heartbeat => "heartbeat",
        }
    }

    /// Parse a received command line
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "full-sync" => Some(Command::FullSync),
            "mem-sync" => Some(Command::MemSync),
            "checkpoint" => Some(Command::Checkpoint),
            "heartbeat" => Some(Command::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed ACK/NACK line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Command succeeded
    Ack,
    /// Command failed
    Nack {
        /// Status code reported by the peer
        code: i32,
        /// Optional human readable text (logged only)
        message: Option<String>,
    },
}

impl Reply {
    /// Parse a reply line (without its terminator)
    pub fn parse(line: &str) -> Result<Self> {
        if line == "ACK" {
            return Ok(Reply::Ack);
        }

        let body = line
            .strip_prefix("NACK=")
            .ok_or_else(|| Error::MalformedReply(line.to_string()))?;
        let (code, message) = match body.split_once(';') {
            Some((code, message)) => (code, Some(message)),
            None => (body, None),
        };
        let code = code
            .parse::<i32>()
            .map_err(|_| Error::MalformedReply(line.to_string()))?;
        let message = message
            .map(|m| m.trim().replace('\r', "\n"))
            .filter(|m| !m.is_empty());

        Ok(Reply::Nack { code, message })
    }

    /// Encode the reply as a single line, newline included
    pub fn encode(&self) -> String {
        match self {
            Reply::Ack => "ACK\n".to_string(),
            Reply::Nack { code, message } => {
                let mut line = format!("NACK={}", code);
                if let Some(message) = message.as_deref().filter(|m| !m.is_empty()) {
                    line.push(';');
                    line.extend(message.chars().map(|c| match c {
                        '\n' | '\0' => '\r',
                        c => c,
                    }));
                }
                truncate_at_char_boundary(&mut line, MAX_REPLY_LENGTH - 1);
                line.push('\n');
                line
            }
        }
    }
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Read one line terminated by `\n` or `\0`.
///
/// At most `limit - 1` bytes of content are accepted; a longer line is a
/// [`Error::BufferOverflow`].
pub async fn read_line<S>(conn: &Connection<S>, limit: usize) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut reader = conn.reader().await;
    let mut line = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) => {
                tracing::warn!(
                    "FTSync: read failed while reading a line ('{}'): {}",
                    String::from_utf8_lossy(&line),
                    e
                );
                return Err(e.into());
            }
        };
        if byte == b'\n' || byte == 0 {
            break;
        }
        if line.len() + 1 >= limit {
            tracing::error!(
                "FTSync: line buffer overflow: '{}'",
                String::from_utf8_lossy(&line)
            );
            return Err(Error::BufferOverflow { limit });
        }
        line.push(byte);
    }
    String::from_utf8(line).map_err(|e| Error::protocol(format!("non UTF-8 line: {}", e)))
}

/// Write `ACK\n`
pub async fn write_ack<S>(conn: &Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    conn.write_all(Reply::Ack.encode().as_bytes()).await
}

/// Write `NACK=<code>[;<message>]\n`
pub async fn write_nack<S>(conn: &Connection<S>, code: i32, message: Option<&str>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let line = Reply::Nack {
        code,
        message: message.map(str::to_string),
    }
    .encode();
    if let Err(e) = conn.write_all(line.as_bytes()).await {
        tracing::error!("FTSync: failed to write {:?}: {}", line.trim_end(), e);
        return Err(e);
    }
    Ok(())
}

/// Read the reply to `which` and turn a NACK into [`Error::Nack`]
pub async fn read_ack<S>(conn: &Connection<S>, which: &str, limit: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let line = read_line(conn, limit).await?;
    match Reply::parse(&line) {
        Ok(Reply::Ack) => Ok(()),
        Ok(Reply::Nack { code, message }) => {
            match message {
                Some(text) => tracing::warn!("FTSync: {}: NACK={} - '{}'", which, code, text),
                None => tracing::warn!("FTSync: {}: NACK={}", which, code),
            }
            Err(Error::Nack { code })
        }
        Err(e) => {
            tracing::warn!("FTSync: {}: unexpected reply {:?}", which, line);
            Err(e)
        }
    }
}

/// Send a command line, optionally waiting for its ACK
pub async fn submit_command<S>(
    conn: &Connection<S>,
    command: Command,
    wait_for_ack: bool,
    limit: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut line = Vec::with_capacity(command.as_str().len() + 1);
    line.extend_from_slice(command.as_str().as_bytes());
    line.push(b'\n');
    conn.write_all(&line).await?;
    tracing::trace!("FTSync: submitted '{}'", command);

    if wait_for_ack {
        read_ack(conn, command.as_str(), limit).await?;
    }
    Ok(())
}

/// Master side of the handshake: verify the banner, send the password, await the ACK.
///
/// The whole exchange must finish within `timeout`.
pub async fn handshake<S>(
    conn: &Connection<S>,
    password: &[u8],
    limit: usize,
    timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    match tokio::time::timeout(timeout, present_credentials(conn, password, limit)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                "FTSync: no handshake reply from {} within {:?}",
                conn.peer(),
                timeout
            );
            Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out").into())
        }
    }
}

async fn present_credentials<S>(conn: &Connection<S>, password: &[u8], limit: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut banner = vec![0u8; WELCOME_BANNER.len()];
    conn.read_exact(&mut banner).await?;
    if banner != WELCOME_BANNER {
        tracing::error!(
            "FTSync: unexpected welcome banner {:?} from {}",
            String::from_utf8_lossy(&banner),
            conn.peer()
        );
        return Err(Error::protocol("welcome banner mismatch"));
    }

    if !password.is_empty() {
        conn.write_all(password).await?;
    }

    match read_ack(conn, "password", limit).await {
        Err(Error::Nack {
            code: status::AUTHENTICATION_FAILURE,
        }) => Err(Error::AuthenticationFailed),
        other => other,
    }
}

/// Standby side of the handshake: send the banner, check the password byte by byte.
///
/// A password that is not complete within `timeout` is rejected.
pub async fn accept_handshake<S>(
    conn: &Connection<S>,
    password: &[u8],
    timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    conn.write_all(WELCOME_BANNER).await?;

    let verdict = match tokio::time::timeout(timeout, check_password(conn, password)).await {
        Ok(verdict) => verdict,
        Err(_) => {
            tracing::warn!(
                "FTSync: password from {} incomplete after {:?}",
                conn.peer(),
                timeout
            );
            Err(Error::AuthenticationFailed)
        }
    };

    match verdict {
        Ok(()) => write_ack(conn).await,
        Err(e) => {
            // Best effort; the connection is abandoned either way
            let _ = write_nack(conn, status::AUTHENTICATION_FAILURE, None).await;
            Err(e)
        }
    }
}

async fn check_password<S>(conn: &Connection<S>, password: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut reader = conn.reader().await;
    for (offset, expected) in password.iter().enumerate() {
        match reader.read_u8().await {
            Ok(byte) if byte == *expected => {}
            Ok(_) => {
                tracing::warn!("FTSync: invalid password (offset={})", offset);
                return Err(Error::AuthenticationFailed);
            }
            Err(e) => {
                tracing::warn!("FTSync: password read failure (offset={}): {}", offset, e);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    const SECOND: Duration = Duration::from_secs(1);

    fn pair() -> (Arc<Connection<DuplexStream>>, Arc<Connection<DuplexStream>>) {
        let (a, b) = tokio::io::duplex(4096);
        (Connection::new(a, "master"), Connection::new(b, "standby"))
    }

    #[test]
    fn test_command_names() {
        for command in [
            Command::FullSync,
            Command::MemSync,
            Command::Checkpoint,
            Command::Heartbeat,
        ] {
            assert_eq!(Command::parse(command.as_str()), Some(command));
        }
        assert_eq!(Command::parse("teleport"), None);
        assert_eq!(Command::parse("mem-sync "), None);
    }

    #[test]
    fn test_reply_parse() {
        assert_eq!(Reply::parse("ACK").unwrap(), Reply::Ack);
        assert_eq!(
            Reply::parse("NACK=-4001").unwrap(),
            Reply::Nack {
                code: -4001,
                message: None
            }
        );
        assert_eq!(
            Reply::parse("NACK=-4008; load failed\rat unit 3 ").unwrap(),
            Reply::Nack {
                code: -4008,
                message: Some("load failed\nat unit 3".to_string())
            }
        );
        assert!(matches!(Reply::parse("ACKNOWLEDGED"), Err(Error::MalformedReply(_))));
        assert!(matches!(Reply::parse("NACK=abc"), Err(Error::MalformedReply(_))));
        assert!(matches!(Reply::parse(""), Err(Error::MalformedReply(_))));
    }

    #[test]
    fn test_nack_encoding_stays_single_line() {
        let line = Reply::Nack {
            code: -4008,
            message: Some("first\nsecond".to_string()),
        }
        .encode();
        assert_eq!(line, "NACK=-4008;first\rsecond\n");

        let long = Reply::Nack {
            code: -1,
            message: Some("x".repeat(1000)),
        }
        .encode();
        assert_eq!(long.len(), MAX_REPLY_LENGTH);
        assert!(long.ends_with('\n'));
        assert_eq!(long.matches('\n').count(), 1);
    }

    #[tokio::test]
    async fn test_read_line_terminators() {
        let (master, standby) = pair();
        master.write_all(b"mem-sync\nheartbeat\0ACK\n").await.unwrap();
        assert_eq!(read_line(&standby, 128).await.unwrap(), "mem-sync");
        assert_eq!(read_line(&standby, 128).await.unwrap(), "heartbeat");
        assert_eq!(read_line(&standby, 128).await.unwrap(), "ACK");
    }

    #[tokio::test]
    async fn test_read_line_overflow() {
        let (master, standby) = pair();
        master.write_all(&[b'a'; 64]).await.unwrap();
        assert!(matches!(
            read_line(&standby, 16).await,
            Err(Error::BufferOverflow { limit: 16 })
        ));
    }

    #[tokio::test]
    async fn test_read_line_fits_limit_minus_one() {
        let (master, standby) = pair();
        master.write_all(b"123456789012345\n").await.unwrap();
        assert_eq!(read_line(&standby, 16).await.unwrap().len(), 15);
    }

    #[tokio::test]
    async fn test_read_ack_maps_nack_code() {
        let (master, standby) = pair();
        write_nack(&standby, status::MEMORY, Some("page apply failed"))
            .await
            .unwrap();
        write_ack(&standby).await.unwrap();
        standby.write_all(b"WHAT\n").await.unwrap();

        assert!(matches!(
            read_ack(&master, "mem-sync-complete", 256).await,
            Err(Error::Nack {
                code: status::MEMORY
            })
        ));
        assert!(read_ack(&master, "mem-sync", 256).await.is_ok());
        assert!(matches!(
            read_ack(&master, "mem-sync", 256).await,
            Err(Error::MalformedReply(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_without_ack() {
        let (master, standby) = pair();
        submit_command(&master, Command::Checkpoint, false, 256)
            .await
            .unwrap();
        assert_eq!(read_line(&standby, 128).await.unwrap(), "checkpoint");
        assert!(!master.has_pending_input().await.unwrap());
    }

    #[tokio::test]
    async fn test_submit_waits_for_ack() {
        let (master, standby) = pair();
        let standby_side = async {
            let line = read_line(&standby, 128).await.unwrap();
            assert_eq!(Command::parse(&line), Some(Command::FullSync));
            write_ack(&standby).await.unwrap();
        };
        let (result, _) = tokio::join!(
            submit_command(&master, Command::FullSync, true, 256),
            standby_side
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (master, standby) = pair();
        let (m, s) = tokio::join!(
            handshake(&master, b"pw", 256, SECOND),
            accept_handshake(&standby, b"pw", SECOND)
        );
        assert!(m.is_ok());
        assert!(s.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_password_mismatch() {
        let (master, standby) = pair();
        let (m, s) = tokio::join!(
            handshake(&master, b"wrong", 256, SECOND),
            accept_handshake(&standby, b"secret", SECOND)
        );
        assert!(matches!(m, Err(Error::AuthenticationFailed)));
        assert!(matches!(s, Err(Error::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_handshake_banner_mismatch() {
        let (master, standby) = pair();
        standby
            .write_all(b"Some-Other-Service-Protocol-9.99\n\n\n\n")
            .await
            .unwrap();
        assert!(matches!(
            handshake(&master, b"", 256, SECOND).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_short_password_is_rejected_after_timeout() {
        for sent in [&b"pw"[..], &b""[..]] {
            let (master, standby) = pair();
            let exchange = async {
                tokio::join!(
                    handshake(&master, sent, 256, Duration::from_secs(2)),
                    accept_handshake(&standby, b"pwd", Duration::from_millis(100))
                )
            };
            let (m, s) = tokio::time::timeout(Duration::from_secs(3), exchange)
                .await
                .unwrap();
            assert!(matches!(m, Err(Error::AuthenticationFailed)));
            assert!(matches!(s, Err(Error::AuthenticationFailed)));
        }
    }

    #[tokio::test]
    async fn test_silent_standby_times_out() {
        let (master, standby) = pair();
        standby.write_all(WELCOME_BANNER).await.unwrap();
        let result = handshake(&master, b"pw", 256, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::TimedOut));
        assert!(result.unwrap_err().is_transport());
    }
}
