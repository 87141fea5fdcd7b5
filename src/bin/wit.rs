//
// SPDX-License-Identifier: MIT
// See LICENSE for details
use wit::cli;

fn main() {
    cli::main()
}
