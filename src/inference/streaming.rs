//! Streaming channel protocol
//!
//! Events delivered over the channel returned by
//! [`LlamaEngine::generate_stream`](crate::inference::engine::LlamaEngine::generate_stream).

use crate::session::StopReason;

/// One event in a streaming generation.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A completed text chunk, always valid UTF-8.
    Chunk(String),
    /// Generation finished; says why.
    Done(StopReason),
    /// The request failed before producing output.
    Error(String),
}

impl StreamEvent {
    pub fn is_chunk(&self) -> bool {
        matches!(self, StreamEvent::Chunk(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }

    /// The chunk text, if this is a chunk.
    pub fn as_chunk(&self) -> Option<&str> {
        match self {
            StreamEvent::Chunk(s) => Some(s),
            _ => None,
        }
    }

    /// The terminal stop reason, if generation finished.
    pub fn stop_reason(&self) -> Option<&StopReason> {
        match self {
            StreamEvent::Done(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_accessors() {
        let chunk = StreamEvent::Chunk("hello".to_string());
        assert!(chunk.is_chunk());
        assert!(!chunk.is_done());
        assert_eq!(chunk.as_chunk(), Some("hello"));
        assert!(chunk.stop_reason().is_none());

        let done = StreamEvent::Done(StopReason::StopToken);
        assert!(done.is_done());
        assert_eq!(done.stop_reason(), Some(&StopReason::StopToken));

        let err = StreamEvent::Error("boom".to_string());
        assert!(err.is_error());
        assert!(!err.is_chunk());
    }
}
