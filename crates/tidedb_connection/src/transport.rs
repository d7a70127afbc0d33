//! Transport abstraction under the persistent connection.
//!
//! The transport carries opaque JSON frames. Opening is asynchronous:
//! readiness is signaled by the server hello arriving through
//! `handle_incoming`, closure is reported via `on_transport_closed`, and
//! all inbound frames are delivered via `handle_incoming`.

use crate::error::{ConnError, ConnResult};
use parking_lot::Mutex;

/// A framed transport to the backend.
pub trait Transport: Send + Sync {
    /// Begins opening the transport. Completion is reported out of band.
    fn open(&self) -> ConnResult<()>;

    /// Sends one frame. Only valid while the transport is open.
    fn send(&self, frame: serde_json::Value) -> ConnResult<()>;

    /// Closes the transport. Idempotent.
    fn close(&self);
}

/// An in-memory transport for tests: records every frame sent.
#[derive(Default)]
pub struct MockTransport {
    open: Mutex<bool>,
    fail_sends: Mutex<bool>,
    sent: Mutex<Vec<serde_json::Value>>,
}

impl MockTransport {
    /// Creates a closed mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames sent so far, oldest first.
    pub fn sent_frames(&self) -> Vec<serde_json::Value> {
        self.sent.lock().clone()
    }

    /// Drops recorded frames.
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Makes subsequent sends fail.
    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock() = fail;
    }

    /// Whether the transport is currently open.
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

impl Transport for MockTransport {
    fn open(&self) -> ConnResult<()> {
        *self.open.lock() = true;
        Ok(())
    }

    fn send(&self, frame: serde_json::Value) -> ConnResult<()> {
        if *self.fail_sends.lock() {
            return Err(ConnError::Transport("mock send failure".into()));
        }
        if !*self.open.lock() {
            return Err(ConnError::Transport("transport not open".into()));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        *self.open.lock() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_frames_in_order() {
        let transport = MockTransport::new();
        transport.open().unwrap();
        transport.send(serde_json::json!({"n": 1})).unwrap();
        transport.send(serde_json::json!({"n": 2})).unwrap();
        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["n"], 1);
    }

    #[test]
    fn send_fails_when_closed() {
        let transport = MockTransport::new();
        assert!(transport.send(serde_json::json!({})).is_err());
        transport.open().unwrap();
        transport.close();
        assert!(transport.send(serde_json::json!({})).is_err());
    }
}
