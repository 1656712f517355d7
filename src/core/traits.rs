use bytes::Bytes;

use crate::core::id::NodeId;

/// A trait used to determine how application payloads carried by the overlay are handled.
///
/// Graviti uses this trait to decide whether an [`App`](crate::message::App) message should be
/// routed any further: payloads that fail to convert or to verify are dropped at the hop that
/// notices. Payloads that reach the node whose identifier is closest to their destination are
/// handed to [`process_data`](ProcessData::process_data).
///
/// Payloads are handled as [`Bytes`] in their encoded state, so that forwarding them doesn't
/// require copying.
pub trait ProcessData<S>: TryFrom<Bytes> {
    /// Returns whether the data is valid or not; the provided implementation returns `true`.
    fn verify_data(&self, _state: S) -> bool {
        true
    }

    /// Processes data delivered to this node; the provided implementation is a no-op.
    ///
    /// Graviti doesn't make any assumptions about how this function should be implemented. E.g.
    /// if you want to run it asynchronously, you can pass in a handle to the runtime in the state
    /// and spawn a task; if you want to send it elsewhere for further processing, you could pass
    /// in a channel sender.
    fn process_data(&self, _state: S, _source: NodeId, _uri: &str) {}
}
