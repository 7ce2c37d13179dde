use std::path::PathBuf;

pub const NUM_TEMPORAL_VALUES: u32 = 5;
pub const NONCE_SIZE: usize = 20;
pub const AES_KEY_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;
/// Older database files carry a SHA-1 checksum after the serialized record.
pub const LEGACY_CHECKSUM_SIZE: usize = 20;

pub const DEFAULT_CA_ORIGIN: &str = "https://chromeos-ca.gserviceaccount.com";
pub const ENROLL_PATH: &str = "/enroll";
pub const SIGN_PATH: &str = "/sign";

pub const PCR_BOOT_MODE: u8 = 0;
pub const PCR_HWID: u8 = 1;

#[derive(clap::Parser, Debug, Clone)]
pub struct Config {
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[arg(long, default_value = "/dev/tpmrm0")]
    pub tpm_device: String,
    /// Encrypted database file. Defaults to the XDG data directory.
    #[arg(long)]
    pub database_path: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_CA_ORIGIN)]
    pub ca_origin: String,
    /// DER SubjectPublicKeyInfo of the CA's encryption key.
    #[arg(long)]
    pub ca_public_key: Option<PathBuf>,
    #[arg(long, default_value = "default")]
    pub ca_key_id: String,
    #[arg(long, default_value_t = 60)]
    pub ca_timeout_secs: u64,
    #[arg(long, default_value = "libchaps.so")]
    pub pkcs11_module: String,
    /// Token holding keys registered without a user.
    #[arg(long, default_value = "System TPM Token")]
    pub system_token_label: String,
}

/// Settings the attestation service itself needs, decoupled from the CLI.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub ca_origin: String,
    pub ca_public_key: Option<Vec<u8>>,
    pub ca_key_id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ca_origin: DEFAULT_CA_ORIGIN.to_string(),
            ca_public_key: None,
            ca_key_id: "default".to_string(),
        }
    }
}
