//! Owned, mutable load commands.
//!
//! The image keeps its command table as a `Vec<LoadCommand>` so individual
//! commands can be patched between flushes and the whole table re-serialized
//! in one write. Commands we do not model (they appear when re-parsing a
//! binary produced by an external linker) are carried as raw bytes and
//! written back verbatim.

use scroll::{Pread, Pwrite, LE};

use crate::macho_format::*;

#[derive(Debug, Clone)]
pub enum LoadCommand {
    Segment {
        seg: SegmentCommand64,
        sections: Vec<Section64>,
    },
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    /// `LC_LOAD_DYLINKER`; `name` is the pathname padded out to `cmdsize`.
    Dylinker {
        cmd: DylinkerCommand,
        name: Vec<u8>,
    },
    /// `LC_LOAD_DYLIB`; `name` is the pathname padded out to `cmdsize`.
    Dylib {
        cmd: DylibCommand,
        name: Vec<u8>,
    },
    DyldInfoOnly(DyldInfoCommand),
    Main(EntryPointCommand),
    VersionMin(VersionMinCommand),
    SourceVersion(SourceVersionCommand),
    Uuid(UuidCommand),
    CodeSignature(LinkeditDataCommand),
    /// Anything else, kept verbatim (`raw` includes cmd and cmdsize).
    Unknown {
        cmd: u32,
        raw: Vec<u8>,
    },
}

impl LoadCommand {
    pub fn cmdsize(&self) -> u32 {
        match self {
            LoadCommand::Segment { seg, .. } => seg.cmdsize,
            LoadCommand::Symtab(cmd) => cmd.cmdsize,
            LoadCommand::Dysymtab(cmd) => cmd.cmdsize,
            LoadCommand::Dylinker { cmd, .. } => cmd.cmdsize,
            LoadCommand::Dylib { cmd, .. } => cmd.cmdsize,
            LoadCommand::DyldInfoOnly(cmd) => cmd.cmdsize,
            LoadCommand::Main(cmd) => cmd.cmdsize,
            LoadCommand::VersionMin(cmd) => cmd.cmdsize,
            LoadCommand::SourceVersion(cmd) => cmd.cmdsize,
            LoadCommand::Uuid(cmd) => cmd.cmdsize,
            LoadCommand::CodeSignature(cmd) => cmd.cmdsize,
            LoadCommand::Unknown { raw, .. } => raw.len() as u32,
        }
    }

    /// Serializes the command at `*offset`, advancing it by `cmdsize`.
    pub fn write_into(&self, buf: &mut [u8], offset: &mut usize) -> Result<(), scroll::Error> {
        match self {
            LoadCommand::Segment { seg, sections } => {
                buf.gwrite_with(*seg, offset, LE)?;
                for section in sections {
                    buf.gwrite_with(*section, offset, LE)?;
                }
            }
            LoadCommand::Symtab(cmd) => {
                buf.gwrite_with(*cmd, offset, LE)?;
            }
            LoadCommand::Dysymtab(cmd) => {
                buf.gwrite_with(*cmd, offset, LE)?;
            }
            LoadCommand::Dylinker { cmd, name } => {
                buf.gwrite_with(*cmd, offset, LE)?;
                buf.gwrite_with(name.as_slice(), offset, ())?;
            }
            LoadCommand::Dylib { cmd, name } => {
                buf.gwrite_with(*cmd, offset, LE)?;
                buf.gwrite_with(name.as_slice(), offset, ())?;
            }
            LoadCommand::DyldInfoOnly(cmd) => {
                buf.gwrite_with(*cmd, offset, LE)?;
            }
            LoadCommand::Main(cmd) => {
                buf.gwrite_with(*cmd, offset, LE)?;
            }
            LoadCommand::VersionMin(cmd) => {
                buf.gwrite_with(*cmd, offset, LE)?;
            }
            LoadCommand::SourceVersion(cmd) => {
                buf.gwrite_with(*cmd, offset, LE)?;
            }
            LoadCommand::Uuid(cmd) => {
                buf.gwrite_with(*cmd, offset, LE)?;
            }
            LoadCommand::CodeSignature(cmd) => {
                buf.gwrite_with(*cmd, offset, LE)?;
            }
            LoadCommand::Unknown { raw, .. } => {
                buf.gwrite_with(raw.as_slice(), offset, ())?;
            }
        }
        Ok(())
    }

    /// Parses one command from the start of `bytes` (which may extend past
    /// this command; `cmdsize` bounds what is consumed).
    pub fn parse(bytes: &[u8]) -> Result<LoadCommand, scroll::Error> {
        let cmd: u32 = bytes.pread_with(0, LE)?;
        let cmdsize: u32 = bytes.pread_with(4, LE)?;
        let body = bytes
            .get(..cmdsize as usize)
            .ok_or(scroll::Error::TooBig {
                size: cmdsize as usize,
                len: bytes.len(),
            })?;

        let parsed = match cmd {
            LC_SEGMENT_64 => {
                let seg: SegmentCommand64 = body.pread_with(0, LE)?;
                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut offset = SIZEOF_SEGMENT_COMMAND_64;
                for _ in 0..seg.nsects {
                    sections.push(body.gread_with(&mut offset, LE)?);
                }
                LoadCommand::Segment { seg, sections }
            }
            LC_SYMTAB => LoadCommand::Symtab(body.pread_with(0, LE)?),
            LC_DYSYMTAB => LoadCommand::Dysymtab(body.pread_with(0, LE)?),
            LC_LOAD_DYLINKER => {
                let cmd: DylinkerCommand = body.pread_with(0, LE)?;
                let name = body
                    .get(std::mem::size_of::<DylinkerCommand>()..)
                    .unwrap_or_default()
                    .to_vec();
                LoadCommand::Dylinker { cmd, name }
            }
            LC_LOAD_DYLIB => {
                let cmd: DylibCommand = body.pread_with(0, LE)?;
                let name = body
                    .get(std::mem::size_of::<DylibCommand>()..)
                    .unwrap_or_default()
                    .to_vec();
                LoadCommand::Dylib { cmd, name }
            }
            LC_DYLD_INFO_ONLY => LoadCommand::DyldInfoOnly(body.pread_with(0, LE)?),
            LC_MAIN => LoadCommand::Main(body.pread_with(0, LE)?),
            LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_TVOS
            | LC_VERSION_MIN_WATCHOS => LoadCommand::VersionMin(body.pread_with(0, LE)?),
            LC_SOURCE_VERSION => LoadCommand::SourceVersion(body.pread_with(0, LE)?),
            LC_UUID => LoadCommand::Uuid(body.pread_with(0, LE)?),
            LC_CODE_SIGNATURE => LoadCommand::CodeSignature(body.pread_with(0, LE)?),
            _ => LoadCommand::Unknown {
                cmd,
                raw: body.to_vec(),
            },
        };
        Ok(parsed)
    }
}
