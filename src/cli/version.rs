//
// SPDX-License-Identifier: MIT
// See LICENSE for details
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn format_version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), VERSION)
}
