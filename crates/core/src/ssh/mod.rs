//! SSH integration
//!
//! Three pieces cooperate to give `ssh <name>` a path into the container:
//! the host-side agent-forwarding proxy ([`proxy`]), the in-container
//! companion agent deployment ([`agent`]), and the `~/.ssh/config` patcher
//! ([`config_patch`]). [`stdio`] turns a runtime `exec` into the byte
//! transport an SSH client's ProxyCommand expects.

pub mod agent;
pub mod config_patch;
pub mod proxy;
pub mod stdio;
