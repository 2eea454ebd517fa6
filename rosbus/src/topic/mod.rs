pub mod publisher;
pub mod subscriber;

/// Lifecycle notifications emitted by publishers, subscribers and service
///  endpoints. Observed through the `events()` broadcast on each handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicEvent {
    /// the master acknowledged the registration
    Registered,
    /// a peer connection completed its handshake
    Connection { peer: String },
    /// a peer connection ended
    Disconnect { peer: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RegistrationState {
    Unregistered,
    Registering,
    Ready,
    Shutdown,
}
