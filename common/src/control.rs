//! In-band control tokens.
//!
//! Control messages are short ASCII tokens. On the multicast path they are
//! carried in a fixed-size, NUL-padded frame of [`CONTROL_FRAME_SIZE`] bytes
//! so a receiver can tell them apart from audio datagrams by size first and
//! by content second. On the recovery channel they travel as
//! newline-terminated lines.
//!
//! The size-then-prefix check is ambiguous: an audio datagram whose wire
//! size equals the control frame size and whose bytes happen to spell a
//! control token is misread as control. A reserved header byte would remove
//! the ambiguity but changes the wire protocol.

use std::fmt;

use thiserror::Error;

/// Wire size of a multicast control frame.
pub const CONTROL_FRAME_SIZE: usize = 64;

const INIT_PREFIX: &str = "<stream length=";
const ACK_PREFIX: &str = "<ack>stream</ack>";
const MISSING_OPEN: &str = "<missing>";
const MISSING_CLOSE: &str = "</missing>";
const FINALIZE: &str = "</stream>";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("unrecognized control token: {0:?}")]
    Unrecognized(String),

    #[error("control token does not fit a {CONTROL_FRAME_SIZE}-byte frame: {0} bytes")]
    FrameOverflow(usize),
}

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `<stream length=N>`: a new song of N datagrams starts.
    StreamInit { expected_count: u32 },

    /// `<ack>stream</ack>N`: a client accepted a stream of N datagrams.
    InitAck { expected_count: u32 },

    /// `<missing>n1 n2 ... </missing>`: sequence numbers to replay.
    Missing(Vec<u32>),

    /// `</stream>`: the sender finished transmitting the current song.
    Finalize,
}

impl ControlMessage {
    // ---
    /// Renders the ASCII token for this message.
    pub fn to_token(&self) -> String {
        // ---
        match self {
            ControlMessage::StreamInit { expected_count } => {
                format!("{INIT_PREFIX}{expected_count}>")
            }
            ControlMessage::InitAck { expected_count } => format!("{ACK_PREFIX}{expected_count}"),
            ControlMessage::Missing(sequences) => {
                let mut token = String::from(MISSING_OPEN);
                for seq in sequences {
                    token.push_str(&seq.to_string());
                    token.push(' ');
                }
                token.push_str(MISSING_CLOSE);
                token
            }
            ControlMessage::Finalize => FINALIZE.to_string(),
        }
    }

    /// Renders a newline-terminated line for the recovery channel.
    pub fn to_line(&self) -> String {
        // ---
        let mut line = self.to_token();
        line.push('\n');
        line
    }

    /// Renders a fixed-size multicast control frame.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::FrameOverflow`] if the token is longer than
    /// [`CONTROL_FRAME_SIZE`].
    pub fn encode_frame(&self) -> Result<Vec<u8>, ControlError> {
        // ---
        let token = self.to_token();
        if token.len() > CONTROL_FRAME_SIZE {
            return Err(ControlError::FrameOverflow(token.len()));
        }

        let mut frame = vec![0u8; CONTROL_FRAME_SIZE];
        frame[..token.len()].copy_from_slice(token.as_bytes());
        Ok(frame)
    }

    /// Parses a control token from raw bytes.
    ///
    /// Trailing NUL padding and surrounding whitespace are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Unrecognized`] if the bytes are not a
    /// well-formed control token.
    pub fn parse(data: &[u8]) -> Result<Self, ControlError> {
        // ---
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let text = std::str::from_utf8(&data[..end])
            .map_err(|_| ControlError::Unrecognized(String::from_utf8_lossy(data).into_owned()))?
            .trim();

        let unrecognized = || ControlError::Unrecognized(text.to_string());

        if text == FINALIZE {
            return Ok(ControlMessage::Finalize);
        }

        if let Some(rest) = text.strip_prefix(INIT_PREFIX) {
            let count = rest.strip_suffix('>').ok_or_else(unrecognized)?;
            let expected_count = count.trim().parse().map_err(|_| unrecognized())?;
            return Ok(ControlMessage::StreamInit { expected_count });
        }

        if let Some(rest) = text.strip_prefix(ACK_PREFIX) {
            let expected_count = rest.trim().parse().map_err(|_| unrecognized())?;
            return Ok(ControlMessage::InitAck { expected_count });
        }

        if let Some(rest) = text.strip_prefix(MISSING_OPEN) {
            let body = rest.strip_suffix(MISSING_CLOSE).ok_or_else(unrecognized)?;
            let sequences = body
                .split_whitespace()
                .map(|n| n.parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| unrecognized())?;
            return Ok(ControlMessage::Missing(sequences));
        }

        Err(unrecognized())
    }

    /// Returns `true` if `data` looks like a multicast control frame.
    ///
    /// Only the size and a parseable token are checked.
    pub fn is_control_frame(data: &[u8]) -> bool {
        data.len() == CONTROL_FRAME_SIZE && Self::parse(data).is_ok()
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}
