use crate::config::Config;
use std::path::Path;

pub fn check(cfg: &Config, database_path: &Path) -> anyhow::Result<()> {
    let mut errors: Vec<String> = Vec::new();

    // TPM device (a full TCTI string is not a path; leave it to tss-esapi)
    if !cfg.tpm_device.contains(':') {
        if let Err(e) = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&cfg.tpm_device)
        {
            errors.push(format!(
                "cannot open {}: {e}\n  \
                 → add the service user to the 'tss' group",
                cfg.tpm_device
            ));
        }
    }

    // Database directory must be creatable
    if let Some(parent) = database_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            errors.push(format!("cannot create {}: {e}", parent.display()));
        }
    }

    // CA encryption key is optional, but if named it must be readable
    if let Some(path) = &cfg.ca_public_key {
        if let Err(e) = std::fs::metadata(path) {
            errors.push(format!(
                "cannot read CA public key {}: {e}\n  \
                 → enrollment will be impossible without it",
                path.display()
            ));
        }
    }

    // A bare module name is resolved by the dynamic loader; only check paths.
    let module = Path::new(&cfg.pkcs11_module);
    if module.is_absolute() && !module.exists() {
        errors.push(format!(
            "PKCS#11 module not found: {}\n  \
             → install the token daemon or pass --pkcs11-module",
            module.display()
        ));
    }

    if errors.is_empty() {
        return Ok(());
    }

    for err in &errors {
        eprintln!("ERROR: {err}");
    }
    anyhow::bail!("{} preflight check(s) failed", errors.len());
}
