pub mod check_config;
pub mod hash_password;
pub mod init;
pub mod serve;

use secmgr_core::codec::{ConfigCodec, ValidityPolicy};

/// Configuration codec for the `--permissive-config` flag.
pub fn codec(permissive: bool) -> ConfigCodec {
    ConfigCodec::new(if permissive {
        ValidityPolicy::Permissive
    } else {
        ValidityPolicy::Strict
    })
}
