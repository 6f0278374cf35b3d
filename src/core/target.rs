// This module describes the machine the JIT generates code for. TargetDescription names the
// architecture and operating system and is detected from the host at session creation; only
// x86-64 on unix-like systems is supported because generated code runs in-process. DataLayout
// carries the properties the IR compiler and the session need: pointer size and alignment,
// byte order, stack alignment and the global symbol prefix used when mangling names (an
// underscore on Mach-O). Its Display output follows the usual data layout string notation.

//! Target description and data layout.

use crate::core::error::{JitError, JitResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86_64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingSystem {
    Linux,
    MacOs,
    FreeBsd,
    OtherUnix,
}

impl OperatingSystem {
    fn name(self) -> &'static str {
        match self {
            OperatingSystem::Linux => "linux",
            OperatingSystem::MacOs => "darwin",
            OperatingSystem::FreeBsd => "freebsd",
            OperatingSystem::OtherUnix => "unix",
        }
    }
}

/// The machine generated code runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDescription {
    pub arch: Architecture,
    pub os: OperatingSystem,
}

impl TargetDescription {
    /// Describe the running host, failing on anything but x86-64 unix.
    pub fn detect_host() -> JitResult<Self> {
        if !cfg!(target_arch = "x86_64") {
            return Err(JitError::TargetDetection {
                reason: format!("architecture {} is not supported", std::env::consts::ARCH),
            });
        }
        if !cfg!(unix) {
            return Err(JitError::TargetDetection {
                reason: format!("operating system {} is not supported", std::env::consts::OS),
            });
        }
        let os = if cfg!(target_os = "linux") {
            OperatingSystem::Linux
        } else if cfg!(target_os = "macos") {
            OperatingSystem::MacOs
        } else if cfg!(target_os = "freebsd") {
            OperatingSystem::FreeBsd
        } else {
            OperatingSystem::OtherUnix
        };
        Ok(Self {
            arch: Architecture::X86_64,
            os,
        })
    }

    /// Parse a target triple such as `x86_64-unknown-linux-gnu`.
    pub fn from_triple(triple: &str) -> JitResult<Self> {
        let mut parts = triple.split('-');
        let arch = parts.next().unwrap_or_default();
        if arch != "x86_64" && arch != "amd64" {
            return Err(JitError::TargetDetection {
                reason: format!("architecture {arch} in {triple} is not supported"),
            });
        }
        let rest: Vec<&str> = parts.collect();
        let has = |name: &str| rest.iter().any(|p| p.starts_with(name));
        let os = if has("linux") {
            OperatingSystem::Linux
        } else if has("darwin") || has("macos") || has("apple") {
            OperatingSystem::MacOs
        } else if has("freebsd") {
            OperatingSystem::FreeBsd
        } else if has("windows") || has("win32") || has("none") || has("uefi") {
            return Err(JitError::TargetDetection {
                reason: format!("operating system in {triple} is not supported"),
            });
        } else {
            OperatingSystem::OtherUnix
        };
        Ok(Self {
            arch: Architecture::X86_64,
            os,
        })
    }

    pub fn triple(&self) -> String {
        match self.os {
            OperatingSystem::MacOs => "x86_64-apple-darwin".to_string(),
            OperatingSystem::Linux => "x86_64-unknown-linux-gnu".to_string(),
            os => format!("x86_64-unknown-{}", os.name()),
        }
    }

    pub fn data_layout(&self) -> DataLayout {
        DataLayout {
            little_endian: true,
            pointer_size: 8,
            pointer_align: 8,
            stack_align: 16,
            global_prefix: (self.os == OperatingSystem::MacOs).then_some('_'),
        }
    }

    /// Whether code for this target can run in the current process.
    pub fn is_host_compatible(&self) -> bool {
        match Self::detect_host() {
            Ok(host) => host.arch == self.arch && host.data_layout() == self.data_layout(),
            Err(_) => false,
        }
    }
}

impl fmt::Display for TargetDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.triple())
    }
}

/// Size, alignment and naming rules of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataLayout {
    pub little_endian: bool,
    /// Bytes.
    pub pointer_size: u32,
    pub pointer_align: u32,
    pub stack_align: u32,
    pub global_prefix: Option<char>,
}

impl DataLayout {
    /// Apply the platform symbol prefix.
    pub fn mangle(&self, name: &str) -> String {
        match self.global_prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        }
    }

    /// Strip the platform symbol prefix, if present.
    pub fn demangle<'a>(&self, name: &'a str) -> &'a str {
        match self.global_prefix {
            Some(prefix) => name.strip_prefix(prefix).unwrap_or(name),
            None => name,
        }
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.pointer_size * 8;
        write!(
            f,
            "{}-m:{}-p:{bits}:{}-i64:64-n8:16:32:64-S{}",
            if self.little_endian { "e" } else { "E" },
            if self.global_prefix.is_some() { "o" } else { "e" },
            self.pointer_align * 8,
            self.stack_align * 8
        )
    }
}
