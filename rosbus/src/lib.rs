//! rosbus is a client library for a ROS1-style robotics middleware: processes
//! ("nodes") exchange typed messages over named topics and make
//! request/response calls over named services. A central master process keeps
//! the registry of publishers, subscribers and services; it is reached via
//! XML-RPC over HTTP. Peer data flows over the TCPROS framed protocol
//! implemented in the [tcpros] crate.
//!
//! Entry point is [node::init], which returns the [NodeHandle] that all
//! publishers, subscribers and service endpoints are created from:
//!
//! ```no_run
//! use rosbus::msg::std_msgs;
//! use rosbus::node::NodeOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let node = rosbus::node::init(NodeOptions::new("/talker")).await?;
//!     let publisher = node.advertise::<std_msgs::String>("/chatter", Default::default()).await?;
//!     publisher.publish(&std_msgs::String { data: "hi".to_string() })?;
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod master;
pub mod msg;
pub mod msggen;
pub mod node;
pub mod service;
pub mod spinner;
pub mod topic;

#[cfg(test)]
pub(crate) mod test_util;

pub use node::{init, NodeHandle, NodeOptions};
pub use tcpros::{RosMessage, RosService};
pub use service::client::{ServiceClient, ServiceClientOptions};
pub use service::server::ServiceServer;
pub use topic::publisher::{Publisher, PublisherOptions};
pub use topic::subscriber::{Subscriber, SubscriberOptions};
pub use topic::TopicEvent;
