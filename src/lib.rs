//! kura: a recipe-driven tool installer.
//!
//! Recipes declare how to fetch and install a tool. kura resolves their
//! dependencies transitively, freezes each install into a checksum-pinned
//! plan, and replays plans with every download verified.

pub mod actions;
pub mod cli;
pub mod core;
pub mod transport;
pub mod tripwire;
