//! Flow orchestration engine.
//!
//! A [`FlowDefinition`](gatehouse_core::flow::FlowDefinition) is compiled once
//! into a [`CompiledGraph`] of step producers and transition tables. Each
//! instance then runs one node at a time: the node produces a step, the step is
//! appended to the instance history, and the router picks the next node. Runs
//! pause when a tool call needs human confirmation or an evaluator asks for
//! clarification.

pub mod confirmation;
pub mod engine;
pub mod graph;
pub mod instance;
pub mod node;
pub mod registry;
pub mod stream;

pub use confirmation::{ToolConfirmation, ToolDenial};
pub use engine::{FlowEngine, InstanceInfo};
pub use graph::{build, route, CompiledGraph, Route};
pub use node::{NodeKind, StepProducer};
pub use registry::Capabilities;
pub use stream::{PublicStep, StepStream, StreamEvent};
