//! Build script for dpworker-runtime
//!
//! Handles configuration merging:
//! 1. Start with library defaults
//! 2. If DPW_CONFIG_RS env var is set, parse the user's config file
//! 3. Merge user values over defaults (user wins)
//! 4. Generate OUT_DIR/dpw_merged_config.rs
//!
//! The user file only lists the values it changes, e.g.
//!
//! ```text
//! pub const NUM_WORKERS: usize = 4;
//! pub const PREEMPTION: &str = "cooperative";
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Configuration parameter definition
struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

/// All configuration parameters with their defaults
const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "NUM_WORKERS",
        rust_type: "usize",
        default_value: "1",
    },
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "256 * 1024",
    },
    ConfigParam {
        name: "MAX_JOBS",
        rust_type: "usize",
        default_value: "1024",
    },
    ConfigParam {
        name: "RESPONSE_POOL_SLOTS",
        rust_type: "usize",
        default_value: "1024",
    },
    ConfigParam {
        name: "RESPONSE_SLOT_SIZE",
        rust_type: "usize",
        default_value: "2048",
    },
    ConfigParam {
        name: "RX_POOL_SLOTS",
        rust_type: "usize",
        default_value: "4096",
    },
    ConfigParam {
        name: "RX_SLOT_SIZE",
        rust_type: "usize",
        default_value: "2048",
    },
    ConfigParam {
        name: "TIME_SLICE_US",
        rust_type: "u64",
        default_value: "10",
    },
    ConfigParam {
        name: "PREEMPTION",
        rust_type: "&str",
        default_value: "\"signal\"",
    },
    ConfigParam {
        name: "PIN_WORKERS",
        rust_type: "bool",
        default_value: "false",
    },
    ConfigParam {
        name: "FIRST_CORE",
        rust_type: "usize",
        default_value: "2",
    },
    ConfigParam {
        name: "INGRESS_CAPACITY",
        rust_type: "usize",
        default_value: "65536",
    },
    ConfigParam {
        name: "DEBUG_LOGGING",
        rust_type: "bool",
        default_value: "false",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("dpw_merged_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    let user_path = env::var("DPW_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);

        match fs::read_to_string(path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", path);
            }
            Err(e) => {
                println!("cargo:warning=Failed to read DPW_CONFIG_RS ({}): {}", path, e);
            }
        }
    }

    println!("cargo:rerun-if-env-changed=DPW_CONFIG_RS");

    let output = generate_config(&config, user_path.is_some());
    fs::write(&dest_path, &output).expect("Failed to write merged config");
}

/// Parse the user's config file and merge known values into `config`
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with("//") || !line.starts_with("pub const ") {
            continue;
        }

        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };

        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown config parameter: {}", name),
        }
    }
}

/// Parse `pub const NAME: TYPE = VALUE;` into (NAME, VALUE)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();

    let colon_pos = rest.find(':')?;
    let name = rest[..colon_pos].trim().to_string();

    let eq_pos = rest.find('=')?;
    let semi_pos = rest.rfind(';').unwrap_or(rest.len());
    if semi_pos <= eq_pos {
        return None;
    }

    let value = rest[eq_pos + 1..semi_pos].trim().to_string();

    Some((name, value))
}

/// Generate the merged config Rust file
fn generate_config(config: &HashMap<&str, String>, from_user: bool) -> String {
    let mut output = String::new();

    output.push_str("// Auto-generated by build.rs - do not edit\n");
    output.push_str("// Configuration merged from library defaults");
    if from_user {
        output.push_str(" and DPW_CONFIG_RS");
    }
    output.push_str("\n\n");

    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_line() {
        let result = parse_const_line("pub const NUM_WORKERS: usize = 8;");
        assert_eq!(result, Some(("NUM_WORKERS".into(), "8".into())));

        let result = parse_const_line("pub const PREEMPTION: &str = \"cooperative\";");
        assert_eq!(result, Some(("PREEMPTION".into(), "\"cooperative\"".into())));

        let result = parse_const_line("pub const STACK_SIZE: usize = 512 * 1024;");
        assert_eq!(result, Some(("STACK_SIZE".into(), "512 * 1024".into())));
    }

    #[test]
    fn test_parse_and_merge() {
        let mut config: HashMap<&str, String> = HashMap::new();
        config.insert("NUM_WORKERS", "1".into());
        config.insert("TIME_SLICE_US", "10".into());

        let user_config = r#"
            // Custom config
            pub const NUM_WORKERS: usize = 6;
            pub const TIME_SLICE_US: u64 = 25;
            pub const NOT_A_PARAM: u64 = 1;
        "#;

        parse_and_merge(user_config, &mut config);

        assert_eq!(config.get("NUM_WORKERS"), Some(&"6".to_string()));
        assert_eq!(config.get("TIME_SLICE_US"), Some(&"25".to_string()));
        assert!(!config.contains_key("NOT_A_PARAM"));
    }

    #[test]
    fn test_generate_config_covers_all_params() {
        let config: HashMap<&str, String> = HashMap::new();
        let out = generate_config(&config, false);
        for p in CONFIG_PARAMS {
            assert!(out.contains(&format!("pub const {}: {} =", p.name, p.rust_type)));
        }
    }
}
