// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # cue-flux-controller
//!
//! A Kubernetes controller that builds `CueInstance` objects from Flux sources
//! and keeps the cluster converged with the evaluated documents.
//!
//! ## Overview
//!
//! Each `CueInstance` names a source artifact, a CUE package inside it and the
//! build parameters. On every cycle the controller:
//!
//! - Waits for the instances it depends on to be ready
//! - Downloads and verifies the source artifact
//! - Evaluates the package with tags and expressions into resource documents
//! - Optionally validates the documents against a schema
//! - Applies them with server-side apply and prunes what is no longer desired
//! - Records the outcome in the instance status and inventory
//!
//! ## Architecture
//!
//! The system is built around the concept of **desired state reconciliation**:
//!
//! 1. **Desired State**: Evaluated from the CUE module at the source revision
//! 2. **Observed State**: The inventory recorded by the previous cycle
//! 3. **Reconciler**: Applies, prunes and reports the difference
//!
//! ## Modules
//!
//! - [`api`]: `CueInstance` types, conditions and inventory
//! - [`config`]: Controller settings and instance file loading
//! - [`state`]: Instance stores (Kubernetes, local files)
//! - [`source`]: Source resolution and artifact download
//! - [`builder`]: CUE evaluation into manifests
//! - [`validate`]: Schema validation policies
//! - [`cluster`]: Target cluster access per identity
//! - [`apply`]: Apply and prune
//! - [`dependency`]: Dependency readiness gate
//! - [`status`]: Status and condition bookkeeping
//! - [`reconciler`]: One reconciliation cycle
//! - [`controller`]: Work queue and worker pool
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: cue.contrib.flux.io/v1alpha1
//! kind: CueInstance
//! metadata:
//!   name: podinfo
//!   namespace: apps
//! spec:
//!   interval: 5m
//!   sourceRef:
//!     kind: GitRepository
//!     name: podinfo
//!   root: ./deploy
//!   path: ./prod
//!   tags:
//!     - name: env
//!       value: prod
//!   prune: true
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod api;
pub mod apply;
pub mod builder;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod dependency;
pub mod error;
pub mod manifest;
pub mod reconciler;
pub mod source;
pub mod state;
pub mod status;
pub mod validate;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use api::{
    CueInstance, CueInstanceSpec, CueInstanceStatus, InstanceKey, ResourceInventory, ResourceRef,
};
pub use apply::{Applier, Pruner};
pub use builder::{CueCliEvaluator, Evaluator, InstanceBuilder};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ControllerSettings, InstanceValidator, SettingsParser};
pub use controller::Controller;
pub use dependency::DependencyGate;
pub use error::{ControllerError, Result};
pub use manifest::Manifest;
pub use reconciler::{Phase, ReconciliationResult, Reconciler};
pub use source::{ArtifactFetcher, SourceResolver};
pub use state::{InstanceStore, KubeInstanceStore, LocalInstanceStore};
pub use status::StatusManager;
pub use validate::Validator;
