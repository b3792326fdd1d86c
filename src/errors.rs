use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unsupported Mach-O target: {0}")]
    UnsupportedMachOArchitecture(target_lexicon::Triple),
    #[error("TODO implement writing object files")]
    TodoImplementWritingObjFiles,
    #[error("TODO implement writing library files")]
    TodoImplementWritingLibFiles,
    #[error("not enough padding between the load commands and the start of __text")]
    NotEnoughPadding,
    #[error("__text section exhausted; cannot grow it in place without moving the entire section")]
    TextSectionFull,
    #[error("the file is not a 64-bit Mach-O binary")]
    InvalidMachHeader,
    #[error("external linker failed: {0}")]
    ExternalLinkerFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Scroll(#[from] scroll::Error),
}

/// Cumulative error state the driver can inspect after a flush. These do
/// not abort the link; a binary with no entry point is still written out.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorFlags {
    pub no_entry_point_found: bool,
}
