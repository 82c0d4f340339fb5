//! Constants shared across the crate.

pub const APP_NAME: &str = "crossbake";

/// Value exported as `SOURCE_DATE_EPOCH` to build scripts.
/// 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch)
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Mount point of the attempt workspace inside a bubblewrap sandbox.
pub const SANDBOX_WORKSPACE: &str = "/workspace";

/// Mount point of the toolchain image inside a bubblewrap sandbox.
pub const SANDBOX_TOOLCHAIN: &str = "/opt/toolchain";

/// Mount point of the host toolchain when it differs from the target one.
pub const SANDBOX_HOST_TOOLCHAIN: &str = "/opt/host-toolchain";

/// Environment variable overriding the download cache location.
pub const CACHE_DIR_ENV: &str = "CROSSBAKE_CACHE_DIR";

/// Directory under the prefix that must hold the package licenses.
pub const LICENSE_DIR: &str = "share/licenses";
