//! Events delivered to a document broker's poll loop.
//!
//! Everything that touches broker-owned state arrives here: framed client
//! messages relayed by the socket layer, kit output from the reader
//! thread, upload outcomes from storage workers, and arbitrary callbacks
//! enqueued by other threads. The poll thread drains the channel and
//! applies each event on the broker, so all mutation stays
//! single-threaded.

use crate::storage::UploadOutcome;
use std::sync::mpsc;

/// A deferred mutation executed on the broker thread.
pub type BrokerCallback = Box<dyn FnOnce(&mut crate::broker::DocumentBroker) + Send>;

/// One unit of work for the broker poll loop.
pub enum BrokerEvent {
    /// Admit a new client session. `outbox` is the socket layer's end of
    /// the session's outbound queue.
    AddSession {
        id: String,
        uri: String,
        read_only: bool,
        outbox: mpsc::Sender<Vec<u8>>,
    },

    /// A session's socket disconnected.
    RemoveSession { id: String },

    /// A framed message from a connected client.
    ClientMessage { session_id: String, data: Vec<u8> },

    /// A frame from the kit's stdout.
    KitMessage(Vec<u8>),

    /// The kit's pipe closed; the process is gone.
    KitExited,

    /// An async PutFile finished.
    UploadComplete {
        session_id: String,
        outcome: UploadOutcome,
        is_save_as: bool,
        is_rename: bool,
    },

    /// A parked clipboard HTTP request handed over by the front-end.
    ClipboardRequest {
        view_id: String,
        tag: String,
        socket: mpsc::Sender<Vec<u8>>,
    },

    /// Ask the document to close (admin, idle, owner termination).
    CloseDocument { reason: String },

    /// Run a closure on the broker thread.
    Callback(BrokerCallback),

    /// Wake the poll without carrying work (state changed elsewhere).
    Wakeup,

    /// Stop the poll loop.
    Stop,
}

impl std::fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddSession { id, read_only, .. } => f
                .debug_struct("AddSession")
                .field("id", id)
                .field("read_only", read_only)
                .finish_non_exhaustive(),
            Self::RemoveSession { id } => f.debug_struct("RemoveSession").field("id", id).finish(),
            Self::ClientMessage { session_id, data } => f
                .debug_struct("ClientMessage")
                .field("session_id", session_id)
                .field("len", &data.len())
                .finish(),
            Self::KitMessage(data) => f.debug_tuple("KitMessage").field(&data.len()).finish(),
            Self::KitExited => write!(f, "KitExited"),
            Self::UploadComplete {
                session_id,
                outcome,
                is_save_as,
                is_rename,
            } => f
                .debug_struct("UploadComplete")
                .field("session_id", session_id)
                .field("outcome", outcome)
                .field("is_save_as", is_save_as)
                .field("is_rename", is_rename)
                .finish(),
            Self::ClipboardRequest { view_id, tag, .. } => f
                .debug_struct("ClipboardRequest")
                .field("view_id", view_id)
                .field("tag", tag)
                .finish_non_exhaustive(),
            Self::CloseDocument { reason } => {
                f.debug_struct("CloseDocument").field("reason", reason).finish()
            }
            Self::Callback(_) => write!(f, "Callback(..)"),
            Self::Wakeup => write!(f, "Wakeup"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

impl BrokerEvent {
    /// Create a client-message event.
    pub fn client_message(session_id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::ClientMessage {
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    /// Create a close event.
    pub fn close(reason: impl Into<String>) -> Self {
        Self::CloseDocument {
            reason: reason.into(),
        }
    }
}
