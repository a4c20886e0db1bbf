//! Weft: a static linker for flat WebAssembly modules against
//! component-level interfaces.
//!
//! Weft takes a set of core modules that speak the scalar ABI, a set of
//! typed host import instances, and a wiring description, and produces a
//! single composed artifact: the input modules byte-identical, synthesized
//! adapter glue, and a manifest describing how to instantiate everything
//! in dependency order.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                    Linker                      │
//! │                                                │
//! │  types      - structural type table            │
//! │  resolve    - host import instances            │
//! │  module     - input module surfaces            │
//! │  adapter    - canonical lowering               │
//! │  trampoline - adapter deduplication            │
//! │  synth      - glue module emission             │
//! │  plan       - instantiation ordering & wiring  │
//! │  emit       - composed artifact container      │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use weft::{CanonicalOptions, Linker};
//!
//! # fn main() -> Result<(), weft::LinkError> {
//! let mut linker = Linker::new();
//! let s32 = linker.types_mut().primitive(weft::Primitive::S32);
//! let frob = linker.types_mut().func([("a", s32)], Some(s32))?;
//! linker.import_func("bar", "frob", frob);
//! linker.add_module("app", std::fs::read("app.wasm").unwrap())?;
//! linker.bind("app", "bar", "frob", CanonicalOptions::default());
//! linker.export("run", "app", "run");
//! let artifact = linker.link()?;
//! std::fs::write("composed.weft", &artifact.bytes).unwrap();
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod emit;
pub mod error;
pub mod linker;
pub mod module;
pub mod plan;
pub mod resolve;
pub mod synth;
pub mod trampoline;
pub mod types;

pub use adapter::{CanonicalOptions, ExportRef, StringEncoding};
pub use emit::{decode, Artifact, DecodedArtifact, Manifest};
pub use error::LinkError;
pub use linker::Linker;
pub use trampoline::DedupPolicy;
pub use types::{Primitive, TypeId, TypeTable};
