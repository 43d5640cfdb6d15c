//! Goblin-based target binary inspection.
//!
//! Before a target is launched the session needs to know what ISA the binary
//! was built for. This module reads just enough of the ELF/PE/Mach-O headers
//! to answer that; it never decodes code.

use std::fs;
use std::path::Path;

use goblin::mach::{constants::cputype, Mach, MachO};
use goblin::{elf, pe, Object};
use log::debug;

use crate::Architecture;

/// Errors that can occur while inspecting a target binary.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The file could not be read.
    #[error("failed to read target: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes are not a recognizable executable object.
    #[error("unrecognized object format: {0}")]
    Unrecognized(String),
}

/// What a session needs to know about a target before launching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    /// ISA the binary was built for.
    pub architecture: Architecture,
    /// Entry point virtual address, if the format provides one.
    pub entry_point: Option<u64>,
    /// Whether the binary requests a dynamic loader at startup.
    pub dynamic: bool,
}

/// Inspect the object file at `path`.
pub fn inspect_file(path: &Path) -> Result<TargetInfo, LoadError> {
    let data = fs::read(path)?;
    inspect(&data)
}

/// Inspect an in-memory object image.
pub fn inspect(data: &[u8]) -> Result<TargetInfo, LoadError> {
    let info = match Object::parse(data) {
        Ok(Object::Elf(elf)) => from_elf(&elf),
        Ok(Object::PE(pe)) => from_pe(&pe),
        Ok(Object::Mach(Mach::Binary(macho))) => from_macho(&macho),
        Ok(Object::Mach(Mach::Fat(_))) => {
            return Err(LoadError::Unrecognized(
                "fat Mach-O images are not supported".into(),
            ))
        }
        Ok(_) => return Err(LoadError::Unrecognized("not an executable object".into())),
        Err(e) => return Err(LoadError::Unrecognized(e.to_string())),
    };

    debug!(
        "detected {} target, entry {:?}, dynamic: {}",
        info.architecture, info.entry_point, info.dynamic
    );
    Ok(info)
}

fn from_elf(elf: &elf::Elf<'_>) -> TargetInfo {
    let architecture = match elf.header.e_machine {
        elf::header::EM_386 => Architecture::X86_32,
        elf::header::EM_X86_64 => Architecture::X86_64,
        elf::header::EM_ARM => Architecture::Arm,
        elf::header::EM_AARCH64 => Architecture::AArch64,
        elf::header::EM_RISCV if elf.is_64 => Architecture::RiscV64,
        _ => Architecture::Unknown,
    };

    TargetInfo {
        architecture,
        entry_point: (elf.entry != 0).then_some(elf.entry),
        dynamic: elf.interpreter.is_some(),
    }
}

fn from_pe(pe: &pe::PE<'_>) -> TargetInfo {
    let architecture = match pe.header.coff_header.machine {
        pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
        pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
        pe::header::COFF_MACHINE_ARM => Architecture::Arm,
        pe::header::COFF_MACHINE_ARM64 => Architecture::AArch64,
        _ => Architecture::Unknown,
    };

    TargetInfo {
        architecture,
        entry_point: (pe.entry != 0).then_some(pe.entry as u64),
        dynamic: !pe.libraries.is_empty(),
    }
}

fn from_macho(macho: &MachO<'_>) -> TargetInfo {
    let architecture = match macho.header.cputype {
        cputype::CPU_TYPE_I386 => Architecture::X86_32,
        cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
        cputype::CPU_TYPE_ARM => Architecture::Arm,
        cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
        _ => Architecture::Unknown,
    };

    TargetInfo {
        architecture,
        entry_point: (macho.entry != 0).then_some(macho.entry),
        // libs[0] is the binary itself.
        dynamic: macho.libs.len() > 1,
    }
}
