//! Target platform model.
//!
//! A [`Platform`] is an immutable (OS, architecture, libc, ABI) tuple. It
//! parses from and serializes to a target triplet such as
//! `x86_64-linux-gnu` or `armv7l-linux-musleabihf-cxx11`, and carries the
//! "can run binaries built for" partial order used when deciding whether a
//! host can execute a compiler shard natively.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TripletError;

/// Operating system of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Os {
    Linux,
    #[serde(rename = "macos")]
    MacOS,
    Windows,
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Os::Linux => "linux",
            Os::MacOS => "macos",
            Os::Windows => "windows",
        })
    }
}

/// CPU architecture of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    I686,
    Aarch64,
    Armv7l,
    Ppc64le,
}

impl Arch {
    /// Name used in triplets.
    pub fn triplet_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I686 => "i686",
            Arch::Aarch64 => "aarch64",
            Arch::Armv7l => "armv7l",
            Arch::Ppc64le => "powerpc64le",
        }
    }

    /// Suffix of the `qemu-system-*` binary that emulates this architecture.
    pub fn qemu_system_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I686 => "i386",
            Arch::Aarch64 => "aarch64",
            Arch::Armv7l => "arm",
            Arch::Ppc64le => "ppc64",
        }
    }

    /// Pointer width in bits.
    pub fn word_size(self) -> u32 {
        match self {
            Arch::X86_64 | Arch::Aarch64 | Arch::Ppc64le => 64,
            Arch::I686 | Arch::Armv7l => 32,
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "x86_64" | "amd64" => Some(Arch::X86_64),
            "i686" | "i386" | "i586" => Some(Arch::I686),
            "aarch64" | "arm64" => Some(Arch::Aarch64),
            "armv7l" | "armv7" | "arm" => Some(Arch::Armv7l),
            "powerpc64le" | "ppc64le" => Some(Arch::Ppc64le),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.triplet_name())
    }
}

/// C library flavour of a Linux target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Libc {
    Glibc,
    Musl,
}

/// Calling convention suffix. Only hard-float ARM carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAbi {
    EabiHf,
}

/// libstdc++ string ABI a C++ build was compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CxxAbi {
    Cxx03,
    Cxx11,
}

impl CxxAbi {
    fn token(self) -> &'static str {
        match self {
            CxxAbi::Cxx03 => "cxx03",
            CxxAbi::Cxx11 => "cxx11",
        }
    }
}

/// A glibc symbol version such as `2.17`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlibcVersion {
    pub major: u32,
    pub minor: u32,
}

impl GlibcVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse a `GLIBC_2.17` symbol version name, or a bare `2.17`.
    pub fn parse(name: &str) -> Option<Self> {
        let version = name.strip_prefix("GLIBC_").unwrap_or(name);
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(minor) => minor.parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor })
    }
}

impl fmt::Display for GlibcVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
    pub libc: Option<Libc>,
    pub call_abi: Option<CallAbi>,
    pub cxx_abi: Option<CxxAbi>,
}

impl Platform {
    /// Linux target with the given libc. ARMv7 always gets the hard-float ABI.
    pub fn linux(arch: Arch, libc: Libc) -> Self {
        Self {
            os: Os::Linux,
            arch,
            libc: Some(libc),
            call_abi: (arch == Arch::Armv7l).then_some(CallAbi::EabiHf),
            cxx_abi: None,
        }
    }

    pub fn macos(arch: Arch) -> Self {
        Self {
            os: Os::MacOS,
            arch,
            libc: None,
            call_abi: None,
            cxx_abi: None,
        }
    }

    pub fn windows(arch: Arch) -> Self {
        Self {
            os: Os::Windows,
            arch,
            libc: None,
            call_abi: None,
            cxx_abi: None,
        }
    }

    pub fn with_cxx_abi(mut self, cxx_abi: Option<CxxAbi>) -> Self {
        self.cxx_abi = cxx_abi;
        self
    }

    /// The same target with the C++ tag removed. Compiler shards are keyed on this.
    pub fn without_cxx_abi(self) -> Self {
        self.with_cxx_abi(None)
    }

    /// Canonical triplet string.
    pub fn triplet(&self) -> String {
        self.to_string()
    }

    pub fn is_linux(&self) -> bool {
        self.os == Os::Linux
    }

    pub fn is_apple(&self) -> bool {
        self.os == Os::MacOS
    }

    pub fn is_windows(&self) -> bool {
        self.os == Os::Windows
    }

    /// Shared library extension without the dot.
    pub fn dlext(&self) -> &'static str {
        match self.os {
            Os::Linux => "so",
            Os::MacOS => "dylib",
            Os::Windows => "dll",
        }
    }

    /// Executable extension including the dot, empty outside Windows.
    pub fn exeext(&self) -> &'static str {
        if self.is_windows() {
            ".exe"
        } else {
            ""
        }
    }

    /// Oldest glibc the shard's sysroot targets, `None` for non-glibc targets.
    pub fn libc_floor(&self) -> Option<GlibcVersion> {
        if self.libc != Some(Libc::Glibc) {
            return None;
        }
        Some(match self.arch {
            Arch::X86_64 | Arch::I686 => GlibcVersion::new(2, 12),
            Arch::Aarch64 | Arch::Ppc64le => GlibcVersion::new(2, 17),
            Arch::Armv7l => GlibcVersion::new(2, 19),
        })
    }

    /// Whether a machine of this platform can execute binaries built for `target`.
    pub fn can_run(&self, target: &Platform) -> bool {
        if self.os != target.os || self.libc != target.libc || self.call_abi != target.call_abi {
            return false;
        }
        let arch_ok = self.arch == target.arch
            || (self.arch == Arch::X86_64 && target.arch == Arch::I686);
        if !arch_ok {
            return false;
        }
        match (self.libc_floor(), target.libc_floor()) {
            (Some(host), Some(needed)) if host < needed => return false,
            _ => {}
        }
        target.cxx_abi.is_none() || target.cxx_abi == self.cxx_abi
    }

    /// The platform of the running machine.
    pub fn host() -> Result<Self, TripletError> {
        let arch = Arch::from_token(std::env::consts::ARCH).ok_or_else(|| {
            TripletError::UnknownArch {
                triplet: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
                arch: std::env::consts::ARCH.to_string(),
            }
        })?;
        match std::env::consts::OS {
            "linux" => {
                let libc = if cfg!(target_env = "musl") {
                    Libc::Musl
                } else {
                    Libc::Glibc
                };
                Ok(Self::linux(arch, libc))
            }
            "macos" => Ok(Self::macos(arch)),
            "windows" => Ok(Self::windows(arch)),
            other => Err(TripletError::Unsupported {
                triplet: format!("{}-{}", std::env::consts::ARCH, other),
                reason: "host operating system is not supported".to_string(),
            }),
        }
    }

    fn check_supported(self, triplet: &str) -> Result<Self, TripletError> {
        let supported = match self.os {
            Os::Linux => match self.libc {
                Some(Libc::Glibc) => true,
                Some(Libc::Musl) => self.arch != Arch::Ppc64le,
                None => false,
            },
            Os::MacOS => self.arch == Arch::X86_64,
            Os::Windows => matches!(self.arch, Arch::X86_64 | Arch::I686),
        };
        if supported {
            Ok(self)
        } else {
            Err(TripletError::Unsupported {
                triplet: triplet.to_string(),
                reason: format!("no toolchain for {} on {}", self.arch, self.os),
            })
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arch = self.arch.triplet_name();
        match self.os {
            Os::Linux => {
                let libc = match self.libc {
                    Some(Libc::Musl) => "musl",
                    _ => "gnu",
                };
                let abi = match self.call_abi {
                    Some(CallAbi::EabiHf) => "eabihf",
                    None => "",
                };
                write!(f, "{arch}-linux-{libc}{abi}")?;
            }
            Os::MacOS => write!(f, "{arch}-apple-darwin14")?,
            Os::Windows => write!(f, "{arch}-w64-mingw32")?,
        }
        if let Some(cxx) = self.cxx_abi {
            write!(f, "-{}", cxx.token())?;
        }
        Ok(())
    }
}

const VENDORS: &[&str] = &["apple", "w64", "pc", "unknown"];

impl FromStr for Platform {
    type Err = TripletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let triplet = s.trim();
        if triplet.is_empty() {
            return Err(TripletError::Empty);
        }

        let mut tokens = triplet.split('-').peekable();
        let arch_token = tokens.next().unwrap_or_default();
        let arch = Arch::from_token(arch_token).ok_or_else(|| TripletError::UnknownArch {
            triplet: triplet.to_string(),
            arch: arch_token.to_string(),
        })?;

        while tokens.peek().is_some_and(|t| VENDORS.contains(t)) {
            tokens.next();
        }

        let os_token = tokens.next().ok_or_else(|| TripletError::UnknownOs {
            triplet: triplet.to_string(),
        })?;
        let mut platform = if os_token == "linux" {
            let (libc, call_abi) = match tokens.peek().copied() {
                Some("gnu") => (Libc::Glibc, None),
                Some("gnueabihf") => (Libc::Glibc, Some(CallAbi::EabiHf)),
                Some("musl") => (Libc::Musl, None),
                Some("musleabihf") => (Libc::Musl, Some(CallAbi::EabiHf)),
                _ => (Libc::Glibc, None),
            };
            if matches!(
                tokens.peek().copied(),
                Some("gnu" | "gnueabihf" | "musl" | "musleabihf")
            ) {
                tokens.next();
            }
            if call_abi.is_some() && arch != Arch::Armv7l {
                return Err(TripletError::Unsupported {
                    triplet: triplet.to_string(),
                    reason: "the eabihf calling convention only exists on armv7l".to_string(),
                });
            }
            Platform::linux(arch, libc)
        } else if os_token.starts_with("darwin") || os_token == "macos" {
            Platform::macos(arch)
        } else if os_token == "mingw32" || os_token == "windows" {
            Platform::windows(arch)
        } else {
            return Err(TripletError::UnknownOs {
                triplet: triplet.to_string(),
            });
        };

        if let Some(token) = tokens.next() {
            platform.cxx_abi = Some(match token {
                "cxx03" => CxxAbi::Cxx03,
                "cxx11" => CxxAbi::Cxx11,
                other => {
                    return Err(TripletError::UnknownComponent {
                        triplet: triplet.to_string(),
                        component: other.to_string(),
                    })
                }
            });
        }
        if let Some(extra) = tokens.next() {
            return Err(TripletError::UnknownComponent {
                triplet: triplet.to_string(),
                component: extra.to_string(),
            });
        }

        platform.check_supported(triplet)
    }
}

impl PartialOrd for Platform {
    /// `a < b` when `b` can run binaries built for `a`.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if other.can_run(self) {
            Some(Ordering::Less)
        } else if self.can_run(other) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let triplet = String::deserialize(deserializer)?;
        triplet.parse().map_err(serde::de::Error::custom)
    }
}

/// Every target a compiler shard exists for.
pub fn supported_platforms() -> Vec<Platform> {
    vec![
        Platform::linux(Arch::I686, Libc::Glibc),
        Platform::linux(Arch::X86_64, Libc::Glibc),
        Platform::linux(Arch::Aarch64, Libc::Glibc),
        Platform::linux(Arch::Armv7l, Libc::Glibc),
        Platform::linux(Arch::Ppc64le, Libc::Glibc),
        Platform::linux(Arch::I686, Libc::Musl),
        Platform::linux(Arch::X86_64, Libc::Musl),
        Platform::linux(Arch::Aarch64, Libc::Musl),
        Platform::linux(Arch::Armv7l, Libc::Musl),
        Platform::macos(Arch::X86_64),
        Platform::windows(Arch::I686),
        Platform::windows(Arch::X86_64),
    ]
}

/// Pick the platform to try first when only one will be built, e.g. for an
/// interactive shell. Linux beats Windows beats macOS; within an OS the
/// architecture order is x86_64, i686, aarch64, ppc64le, armv7l.
pub fn pick_preferred_platform(platforms: &[Platform]) -> Option<Platform> {
    let mut candidates: Vec<Platform> = platforms.to_vec();
    for os in [Os::Linux, Os::Windows, Os::MacOS] {
        if candidates.iter().any(|p| p.os == os) {
            candidates.retain(|p| p.os == os);
            break;
        }
    }
    for arch in [
        Arch::X86_64,
        Arch::I686,
        Arch::Aarch64,
        Arch::Ppc64le,
        Arch::Armv7l,
    ] {
        if let Some(p) = candidates.iter().find(|p| p.arch == arch) {
            return Some(*p);
        }
    }
    candidates.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Platform {
        s.parse().unwrap()
    }

    #[test]
    fn canonical_triplets_round_trip() {
        for platform in supported_platforms() {
            let triplet = platform.to_string();
            assert_eq!(p(&triplet), platform, "{triplet}");
            let tagged = platform.with_cxx_abi(Some(CxxAbi::Cxx11));
            assert_eq!(p(&tagged.to_string()), tagged);
        }
        assert_eq!(p("armv7l-linux-musleabihf-cxx03").to_string(), "armv7l-linux-musleabihf-cxx03");
    }

    #[test]
    fn aliases_serialize_canonically() {
        assert_eq!(p("x86_64-unknown-linux-gnu").to_string(), "x86_64-linux-gnu");
        assert_eq!(p("ppc64le-linux-gnu").to_string(), "powerpc64le-linux-gnu");
        assert_eq!(p("arm-linux-gnueabihf").to_string(), "armv7l-linux-gnueabihf");
        assert_eq!(p("x86_64-pc-mingw32").to_string(), "x86_64-w64-mingw32");
        assert_eq!(p("x86_64-apple-darwin17").to_string(), "x86_64-apple-darwin14");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!("".parse::<Platform>(), Err(TripletError::Empty));
        assert!(matches!(
            "sparc-linux-gnu".parse::<Platform>(),
            Err(TripletError::UnknownArch { .. })
        ));
        assert!(matches!(
            "x86_64-haiku".parse::<Platform>(),
            Err(TripletError::UnknownOs { .. })
        ));
        assert!(matches!(
            "x86_64-linux-gnu-cxx17".parse::<Platform>(),
            Err(TripletError::UnknownComponent { .. })
        ));
        assert!(matches!(
            "aarch64-apple-darwin14".parse::<Platform>(),
            Err(TripletError::Unsupported { .. })
        ));
    }

    #[test]
    fn can_run_order() {
        let x64 = p("x86_64-linux-gnu");
        let x86 = p("i686-linux-gnu");
        let arm = p("aarch64-linux-gnu");
        assert!(x64.can_run(&x86));
        assert!(!x86.can_run(&x64));
        assert!(!x64.can_run(&arm));
        assert!(!x64.can_run(&p("x86_64-linux-musl")));
        assert!(x86 < x64);
        assert_eq!(x64.partial_cmp(&arm), None);

        let tagged = x64.with_cxx_abi(Some(CxxAbi::Cxx11));
        assert!(tagged.can_run(&x64));
        assert!(!x64.can_run(&tagged));
        assert!(!tagged.can_run(&x64.with_cxx_abi(Some(CxxAbi::Cxx03))));
    }

    #[test]
    fn libc_floors() {
        assert_eq!(p("x86_64-linux-gnu").libc_floor(), Some(GlibcVersion::new(2, 12)));
        assert_eq!(p("aarch64-linux-gnu").libc_floor(), Some(GlibcVersion::new(2, 17)));
        assert_eq!(p("armv7l-linux-gnueabihf").libc_floor(), Some(GlibcVersion::new(2, 19)));
        assert_eq!(p("x86_64-linux-musl").libc_floor(), None);
        assert_eq!(GlibcVersion::parse("GLIBC_2.3.4"), Some(GlibcVersion::new(2, 3)));
    }

    #[test]
    fn preferred_platform() {
        let all = supported_platforms();
        assert_eq!(pick_preferred_platform(&all), Some(p("x86_64-linux-gnu")));
        let non_linux = [p("x86_64-apple-darwin14"), p("i686-w64-mingw32")];
        assert_eq!(pick_preferred_platform(&non_linux), Some(p("i686-w64-mingw32")));
        let arm_only = [p("armv7l-linux-gnueabihf"), p("powerpc64le-linux-gnu")];
        assert_eq!(pick_preferred_platform(&arm_only), Some(p("powerpc64le-linux-gnu")));
        assert_eq!(pick_preferred_platform(&[]), None);
    }

    #[test]
    fn serde_uses_triplets() {
        let json = serde_json::to_string(&p("i686-w64-mingw32")).unwrap();
        assert_eq!(json, "\"i686-w64-mingw32\"");
        let back: Platform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("i686-w64-mingw32"));
    }
}
