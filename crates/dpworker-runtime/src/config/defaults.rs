//! Compile-time defaults, merged by build.rs from library values and the
//! optional `DPW_CONFIG_RS` override file.

include!(concat!(env!("OUT_DIR"), "/dpw_merged_config.rs"));
