/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The fixed-width six-byte frames on the parent↔worker command channel.
//!
//! Parent to worker: `A\0\0\0\0\n` accept the next connection, `P\0\0\0\0\n`
//! ping. Worker to parent: `I`/`B` + big-endian worker id + `\n`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::READ_MAX_SECS;

pub const FRAME_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Accept,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Idle(u32),
    Busy(u32),
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    BadVerb(u8),
    BadTerminator,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BadVerb(v) => write!(f, "unknown frame verb {v:#04x}"),
            FrameError::BadTerminator => f.write_str("frame not newline-terminated"),
        }
    }
}

impl std::error::Error for FrameError {}

pub fn encode_command(command: Command) -> [u8; FRAME_LEN] {
    let verb = match command {
        Command::Accept => b'A',
        Command::Ping => b'P',
    };
    [verb, 0, 0, 0, 0, b'\n']
}

pub fn decode_command(frame: &[u8; FRAME_LEN]) -> Result<Command, FrameError> {
    if frame[FRAME_LEN - 1] != b'\n' {
        return Err(FrameError::BadTerminator);
    }
    match frame[0] {
        b'A' => Ok(Command::Accept),
        b'P' => Ok(Command::Ping),
        other => Err(FrameError::BadVerb(other)),
    }
}

pub fn encode_report(report: Report) -> [u8; FRAME_LEN] {
    let (verb, id) = match report {
        Report::Idle(id) => (b'I', id),
        Report::Busy(id) => (b'B', id),
    };
    let id = id.to_be_bytes();
    [verb, id[0], id[1], id[2], id[3], b'\n']
}

pub fn decode_report(frame: &[u8; FRAME_LEN]) -> Result<Report, FrameError> {
    if frame[FRAME_LEN - 1] != b'\n' {
        return Err(FrameError::BadTerminator);
    }
    let id = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    match frame[0] {
        b'I' => Ok(Report::Idle(id)),
        b'B' => Ok(Report::Busy(id)),
        other => Err(FrameError::BadVerb(other)),
    }
}

/// Read one whole frame, accumulating partial reads. Waiting for a frame to
/// begin is unbounded (idle channels are normal); a peer that stalls
/// mid-frame is dead once the deadline passes.
pub async fn read_frame<S>(stream: &mut S) -> std::io::Result<[u8; FRAME_LEN]>
where
    S: AsyncRead + Unpin,
{
    let mut frame = [0u8; FRAME_LEN];
    let mut have = stream.read(&mut frame).await?;
    if have == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "command channel closed",
        ));
    }

    let deadline = Duration::from_secs(READ_MAX_SECS);
    tokio::time::timeout(deadline, async {
        while have < FRAME_LEN {
            let n = stream.read(&mut frame[have..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "command channel closed",
                ));
            }
            have += n;
        }
        Ok(frame)
    })
    .await
    .map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "command channel read timed out")
    })?
}

pub async fn write_frame<S>(stream: &mut S, frame: &[u8; FRAME_LEN]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frames_are_byte_exact() {
        assert_eq!(encode_command(Command::Accept), *b"A\0\0\0\0\n");
        assert_eq!(encode_command(Command::Ping), *b"P\0\0\0\0\n");
        assert_eq!(decode_command(b"A\0\0\0\0\n").unwrap(), Command::Accept);
        assert_eq!(decode_command(b"P\0\0\0\0\n").unwrap(), Command::Ping);
        assert!(decode_command(b"X\0\0\0\0\n").is_err());
        assert!(decode_command(b"A\0\0\0\0x").is_err());
    }

    #[test]
    fn report_frames_carry_big_endian_ids() {
        assert_eq!(encode_report(Report::Idle(258)), *b"I\0\0\x01\x02\n");
        assert_eq!(encode_report(Report::Busy(1)), *b"B\0\0\0\x01\n");
        assert_eq!(decode_report(b"I\0\0\x01\x02\n").unwrap(), Report::Idle(258));
        assert_eq!(decode_report(b"B\0\0\0\x01\n").unwrap(), Report::Busy(1));
    }

    #[tokio::test]
    async fn frames_survive_partial_reads() {
        let (mut client, mut server) = tokio::io::duplex(8);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let frame = encode_report(Report::Idle(7));
            client.write_all(&frame[..3]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            client.write_all(&frame[3..]).await.unwrap();
        });
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(decode_report(&frame).unwrap(), Report::Idle(7));
    }

    #[tokio::test]
    async fn eof_is_an_error() {
        let (client, mut server) = tokio::io::duplex(8);
        drop(client);
        assert!(read_frame(&mut server).await.is_err());
    }
}
