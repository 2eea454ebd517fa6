//! Bundled message and service types: hand-maintained equivalents of what
//! the schema generator emits, for the types the library itself exercises in
//! its tests and examples. Everything else comes from generated code (see
//! the `generate-messages` binary).

pub mod rospy_tutorials;
pub mod std_msgs;
