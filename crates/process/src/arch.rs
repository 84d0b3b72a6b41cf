use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use eyre::WrapErr;

/// Processor architecture of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
    S390x,
    Ppc64le,
    RiscV64,
    LoongArch64,
    Unknown,
}

impl Architecture {
    /// Architecture this binary was compiled for
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "x86" => Architecture::X86,
            "x86_64" => Architecture::X64,
            "arm" => Architecture::Arm,
            "aarch64" => Architecture::Arm64,
            "s390x" => Architecture::S390x,
            // big-endian powerpc64 has no variant of its own
            "powerpc64" if cfg!(target_endian = "little") => Architecture::Ppc64le,
            "riscv64" => Architecture::RiscV64,
            "loongarch64" => Architecture::LoongArch64,
            _ => Architecture::Unknown,
        }
    }

    /// Read the architecture from the ELF header of an executable
    pub fn of_executable(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let mut header = [0u8; ELF_HEADER_PREFIX];
        File::open(path)
            .and_then(|mut file| file.read_exact(&mut header))
            .wrap_err_with(|| format!("reading executable header of {}", path.display()))?;
        from_elf_header(&header)
            .ok_or_else(|| eyre::eyre!("{} is not an ELF executable", path.display()))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
            Architecture::S390x => "s390x",
            Architecture::Ppc64le => "ppc64le",
            Architecture::RiscV64 => "riscv64",
            Architecture::LoongArch64 => "loongarch64",
            Architecture::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// e_ident (16 bytes), e_type (2), e_machine (2)
const ELF_HEADER_PREFIX: usize = 20;
const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const EI_DATA: usize = 5;
const ELF_DATA_BIG_ENDIAN: u8 = 2;

/// Map the `e_machine` field of an ELF header to an architecture.
///
/// Returns `None` when `header` does not start with the ELF magic.
pub(crate) fn from_elf_header(header: &[u8]) -> Option<Architecture> {
    if header.len() < ELF_HEADER_PREFIX || &header[..4] != ELF_MAGIC {
        return None;
    }

    let machine_bytes = [header[18], header[19]];
    let big_endian = header[EI_DATA] == ELF_DATA_BIG_ENDIAN;
    let machine = if big_endian {
        u16::from_be_bytes(machine_bytes)
    } else {
        u16::from_le_bytes(machine_bytes)
    };

    let arch = match machine {
        3 => Architecture::X86,
        62 => Architecture::X64,
        40 => Architecture::Arm,
        183 => Architecture::Arm64,
        22 => Architecture::S390x,
        21 if !big_endian => Architecture::Ppc64le,
        243 => Architecture::RiscV64,
        258 => Architecture::LoongArch64,
        _ => Architecture::Unknown,
    };
    Some(arch)
}
