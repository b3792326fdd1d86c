//! An incremental linker producing 64-bit Mach-O executables for Darwin
//! (x86_64 and aarch64).
//!
//! The linker keeps a mutable Mach-O image on disk and patches it in place
//! as individual top-level declarations are added, grown, shrunk and
//! removed between invocations of the driver, instead of re-linking the
//! world on every change. It can also shell out to a system linker for a
//! full link and retro-fit the resulting binary with an ad-hoc code
//! signature.

pub mod codesig;
pub mod commands;
pub mod errors;
pub mod image;
pub mod macho_format;
pub mod module;
pub mod target;
pub mod trie;

pub use errors::{ErrorFlags, LinkError};
pub use image::{Image, LinkOptions, OutputMode};
pub use module::{CodeGen, Decl, DeclIndex, Export, GeneratedCode, Linkage, Module, PieFixup};
