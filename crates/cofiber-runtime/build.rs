//! Build script for cofiber-runtime
//!
//! Generates `OUT_DIR/cofiber_defaults.rs` with one `pub const` per tunable.
//! If `COFIBER_CONFIG_RS` names a file, any `pub const NAME: TYPE = VALUE;`
//! lines in it replace the library default for NAME.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

/// A tunable and its library default
struct Tunable {
    name: &'static str,
    ty: &'static str,
    default: &'static str,
}

const TUNABLES: &[Tunable] = &[
    Tunable { name: "STACK_SIZE", ty: "usize", default: "128 * 1024" },
    Tunable { name: "MIN_STACK_SIZE", ty: "usize", default: "16 * 1024" },
    Tunable { name: "CONNECT_TIMEOUT_MS", ty: "u64", default: "5000" },
    Tunable { name: "MAX_WAIT_MS", ty: "u64", default: "5000" },
    Tunable { name: "MAX_EVENTS", ty: "usize", default: "256" },
    Tunable { name: "REACTOR_FD_TABLE", ty: "usize", default: "32" },
    Tunable { name: "HOOK_FD_TABLE", ty: "usize", default: "64" },
    Tunable { name: "ROLLBACK_MS", ty: "u64", default: "60 * 60 * 1000" },
    Tunable { name: "PARK_TIMEOUT_MS", ty: "u64", default: "10" },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest = Path::new(&out_dir).join("cofiber_defaults.rs");

    let mut values: BTreeMap<&'static str, String> = TUNABLES
        .iter()
        .map(|t| (t.name, t.default.to_string()))
        .collect();

    println!("cargo:rerun-if-env-changed=COFIBER_CONFIG_RS");
    let user_file = env::var("COFIBER_CONFIG_RS").ok();
    if let Some(path) = &user_file {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(text) => {
                for (name, value) in overrides(&text) {
                    match TUNABLES.iter().find(|t| t.name == name) {
                        Some(t) => {
                            values.insert(t.name, value);
                        }
                        None => println!("cargo:warning=unknown cofiber tunable: {}", name),
                    }
                }
            }
            Err(e) => println!("cargo:warning=cannot read COFIBER_CONFIG_RS ({}): {}", path, e),
        }
    }

    fs::write(&dest, render(&values, user_file.is_some())).expect("failed to write defaults");
}

/// Pull `(NAME, VALUE)` pairs out of `pub const NAME: TYPE = VALUE;` lines
fn overrides(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with("//"))
        .filter_map(|l| {
            let rest = l.strip_prefix("pub const ")?;
            let (name, rest) = rest.split_once(':')?;
            let (_, value) = rest.split_once('=')?;
            let value = value.trim().trim_end_matches(';').trim();
            Some((name.trim().to_string(), value.to_string()))
        })
        .collect()
}

fn render(values: &BTreeMap<&'static str, String>, merged: bool) -> String {
    let mut out = String::from("// Generated by cofiber-runtime/build.rs\n");
    if merged {
        out.push_str("// Merged with COFIBER_CONFIG_RS overrides\n");
    }
    for t in TUNABLES {
        out.push_str(&format!("pub const {}: {} = {};\n", t.name, t.ty, values[t.name]));
    }
    out
}
