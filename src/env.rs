//! Environment synthesized for commands run inside a sandbox.
//!
//! The layout is fixed for every runner: the workspace is mounted at
//! [`WORKSPACE`], sources live in [`SRCDIR`], the install prefix is
//! [`PREFIX`], and the target's compiler shard is mounted under
//! `/opt/<triplet>`.

use std::collections::BTreeMap;

use crate::error::TripletError;
use crate::platform::{Os, Platform};

/// Workspace mount point inside the sandbox.
pub const WORKSPACE: &str = "/workspace";
/// Unpacked sources inside the sandbox.
pub const SRCDIR: &str = "/workspace/srcdir";
/// Install prefix inside the sandbox.
pub const PREFIX: &str = "/workspace/destdir";
/// Home directory of the sandbox user.
pub const SANDBOX_HOME: &str = "/root";

/// Directory the compiler shard for `platform` is mounted at.
pub fn toolchain_dir(platform: &Platform) -> String {
    format!("/opt/{}", platform.without_cxx_abi())
}

/// Compute every environment variable injected for `triplet`.
///
/// Pure and deterministic; fails only when the triplet does not parse.
pub fn target_envs(triplet: &str) -> Result<BTreeMap<String, String>, TripletError> {
    let platform: Platform = triplet.parse()?;
    Ok(platform_envs(&platform))
}

/// [`target_envs`] for an already parsed platform.
pub fn platform_envs(platform: &Platform) -> BTreeMap<String, String> {
    let target = platform.to_string();
    let tool_triplet = platform.without_cxx_abi().to_string();
    let opt = toolchain_dir(platform);
    let tool = |name: &str| format!("{opt}/bin/{tool_triplet}-{name}");

    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set(
        "PATH",
        format!("{opt}/bin:/usr/local/bin:/usr/bin:/bin:{PREFIX}/bin"),
    );
    set(
        "LD_LIBRARY_PATH",
        format!("/usr/local/lib64:/usr/local/lib:/usr/lib64:/usr/lib:/lib64:/lib:{PREFIX}/lib"),
    );
    set("target", target.clone());
    set("TARGET", target);

    let (cc, cxx) = match platform.os {
        Os::MacOS => ("clang", "clang++"),
        Os::Linux | Os::Windows => ("gcc", "g++"),
    };
    set("CC", tool(cc));
    set("CXX", tool(cxx));
    set("FC", tool("gfortran"));
    for (var, name) in [
        ("AR", "ar"),
        ("AS", "as"),
        ("LD", "ld"),
        ("NM", "nm"),
        ("RANLIB", "ranlib"),
        ("STRIP", "strip"),
        ("OBJCOPY", "objcopy"),
        ("OBJDUMP", "objdump"),
    ] {
        set(var, tool(name));
    }
    match platform.os {
        Os::Linux => set("READELF", tool("readelf")),
        Os::Windows => {
            set("DLLTOOL", tool("dlltool"));
            set("WINDRES", tool("windres"));
        }
        Os::MacOS => {
            set("LIPO", tool("lipo"));
            set("INSTALL_NAME_TOOL", tool("install_name_tool"));
        }
    }

    // DLLs are installed beside executables on Windows.
    let libdir = if platform.is_windows() {
        format!("{PREFIX}/bin")
    } else {
        format!("{PREFIX}/lib")
    };
    set("prefix", PREFIX.to_string());
    set("bindir", format!("{PREFIX}/bin"));
    set("libdir", libdir);
    set("includedir", format!("{PREFIX}/include"));
    set("srcdir", SRCDIR.to_string());
    set("WORKSPACE", WORKSPACE.to_string());
    set(
        "PKG_CONFIG_PATH",
        format!("{PREFIX}/lib/pkgconfig:{PREFIX}/share/pkgconfig"),
    );
    set("PKG_CONFIG_SYSROOT_DIR", PREFIX.to_string());
    set(
        "CMAKE_TOOLCHAIN_FILE",
        format!("{opt}/{tool_triplet}.toolchain"),
    );
    set("HOME", SANDBOX_HOME.to_string());
    set("TERM", "screen".to_string());

    env
}

/// `platform_envs` overlaid with caller-supplied variables.
pub fn session_envs(
    platform: &Platform,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = platform_envs(platform);
    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
