//! Compiles XML documents into a compact, read-only, mmap-friendly binary
//! blob (a "silo") and answers XPath-subset queries against it in place.
//!
//! Long-lived processes that repeatedly query large, slowly changing XML
//! corpora (software catalogs, package metadata, firmware databases) pay for
//! a full parse into per-node heap objects on every startup. A silo is built
//! once, persisted, and then memory-mapped: queries traverse the fixed-layout
//! node records directly with negligible parse-time overhead.
//!
//! ```
//! use xmlsilo::Silo;
//!
//! let silo = Silo::from_xml(
//!   "<components origin=\"lvfs\">\
//!      <component type=\"desktop\"><id>gimp.desktop</id></component>\
//!    </components>",
//! )
//! .unwrap();
//! let node = silo
//!   .query_first("components/component[@type='desktop']/id")
//!   .unwrap();
//! assert_eq!(node.text(), Some("gimp.desktop"));
//! ```

pub mod arena;
pub mod builder;
pub mod builder_fixup;
pub mod builder_node;
pub mod builder_source;
pub mod cancellable;
pub mod error;
pub mod guid;
pub mod machine;
pub mod node;
pub mod opcode;
pub mod query;
pub mod query_context;
pub mod silo;
pub mod silo_export;
mod silo_node;
mod silo_query;
pub mod stack;
pub mod strings;
mod strtab;

pub use self::{
  arena::Arena,
  builder::{Builder, CompileFlags},
  builder_fixup::BuilderFixup,
  builder_node::{BuilderNode, BuilderNodeFlags, TraverseOrder},
  builder_source::{BuilderSource, SourceFlags},
  cancellable::Cancellable,
  error::{Error, Result},
  guid::Guid,
  machine::{Machine, MachineParseFlags},
  node::Node,
  opcode::{Opcode, OpcodeKind},
  query::{Query, QueryFlags},
  query_context::{QueryContext, ValueBindings},
  silo::{LoadFlags, Silo},
  silo_export::ExportFlags,
  strtab::UNSET,
};
