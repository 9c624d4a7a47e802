use crate::codec::{self, FrameError};
use crate::models::{Acknowledgment, LogMessage};
use std::io::{self, BufReader, Read, Stdin, Stdout, Write};
use tracing::debug;

/// One native-messaging connection: frames in on `reader`, acknowledgments
/// out on `writer`.
pub struct MessageHost<R: Read, W: Write> {
    reader: BufReader<R>,
    writer: W,
}

impl MessageHost<Stdin, Stdout> {
    /// The connection a browser hands us: our own stdin/stdout.
    pub fn stdio() -> Self {
        MessageHost::new(io::stdin(), io::stdout())
    }
}

impl<R: Read, W: Write> MessageHost<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        MessageHost {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Pull the next message. `Ok(None)` is a clean end of stream.
    pub fn read_message(&mut self) -> Result<Option<LogMessage>, FrameError> {
        let message: Option<LogMessage> = codec::read_message(&mut self.reader)?;
        if let Some(msg) = &message {
            debug!(level = %msg.level, url = %msg.url, "received message");
        }
        Ok(message)
    }

    pub fn write_acknowledgment(&mut self, ack: &Acknowledgment) -> Result<(), FrameError> {
        codec::write_frame(&mut self.writer, ack)
    }

    pub fn send_acknowledgment(&mut self, success: bool, error: &str) -> Result<(), FrameError> {
        self.write_acknowledgment(&Acknowledgment::new(success, error))
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u32).to_ne_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn reads_message_then_end_of_stream() {
        let payload = br#"{"type":"console","level":"info","message":"hello","url":"http://localhost/","timestamp":"2024-01-01T00:00:00Z"}"#;
        let mut host = MessageHost::new(Cursor::new(frame(payload)), Vec::new());

        let msg = host.read_message().unwrap().unwrap();
        assert_eq!(msg.message, "hello");
        assert_eq!(msg.level, "info");
        assert!(host.read_message().unwrap().is_none());
    }

    #[test]
    fn acknowledgments_are_framed() {
        let mut host = MessageHost::new(Cursor::new(Vec::new()), Vec::new());
        host.send_acknowledgment(true, "").unwrap();
        host.send_acknowledgment(false, "bad frame").unwrap();

        let out = host.into_writer();
        let mut reader = Cursor::new(out);
        let first: Acknowledgment = codec::read_message(&mut reader).unwrap().unwrap();
        let second: Acknowledgment = codec::read_message(&mut reader).unwrap().unwrap();
        assert_eq!(first, Acknowledgment::ok());
        assert_eq!(second.error.as_deref(), Some("bad frame"));
        assert!(!second.success);
    }
}
