//! Target-triple queries the linker needs: cpu type/subtype for the Mach
//! header, the page size used for segment alignment and code-signature
//! hashing, and the `LC_VERSION_MIN_*` encoding.

use target_lexicon::{Architecture, DeploymentTarget, OperatingSystem, Triple};

use crate::errors::LinkError;
use crate::macho_format as format;

/// Version-min fallback when the triple does not carry an OS version.
const DEFAULT_MACOS_VERSION: (u16, u8, u8) = (10, 14, 0);

/// Page size backing all segment arithmetic. Apple Silicon uses 16 KiB
/// pages; everything else 4 KiB.
pub fn page_size(triple: &Triple) -> u64 {
    match triple.architecture {
        Architecture::Aarch64(_) => 0x4000,
        _ => 0x1000,
    }
}

/// `(cputype, cpusubtype)` for the Mach header.
pub fn cpu_type(triple: &Triple) -> Result<(u32, u32), LinkError> {
    match triple.architecture {
        Architecture::X86_64 => Ok((format::CPU_TYPE_X86_64, format::CPU_SUBTYPE_X86_64_ALL)),
        Architecture::Aarch64(_) => Ok((format::CPU_TYPE_ARM64, format::CPU_SUBTYPE_ARM64_ALL)),
        _ => Err(LinkError::UnsupportedMachOArchitecture(triple.clone())),
    }
}

/// `(command kind, packed version)` for the `LC_VERSION_MIN_*` command.
/// Versions are packed as `(major << 16) | (minor << 8) | patch`.
pub fn version_min(triple: &Triple) -> Result<(u32, u32), LinkError> {
    let (cmd, (major, minor, patch)) = match triple.operating_system {
        OperatingSystem::MacOSX(Some(DeploymentTarget {
            major,
            minor,
            patch,
        })) => (format::LC_VERSION_MIN_MACOSX, (major, minor, patch)),
        OperatingSystem::MacOSX(None) | OperatingSystem::Darwin(_) => {
            (format::LC_VERSION_MIN_MACOSX, DEFAULT_MACOS_VERSION)
        }
        OperatingSystem::IOS(_) => (format::LC_VERSION_MIN_IPHONEOS, (11, 0, 0)),
        OperatingSystem::TvOS(_) => (format::LC_VERSION_MIN_TVOS, (11, 0, 0)),
        _ => return Err(LinkError::UnsupportedMachOArchitecture(triple.clone())),
    };
    let packed = (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch);
    Ok((cmd, packed))
}

/// Rejects triples the incremental linker cannot target at all.
pub fn validate(triple: &Triple) -> Result<(), LinkError> {
    cpu_type(triple)?;
    version_min(triple)?;
    Ok(())
}
