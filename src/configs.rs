use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "vpn-pki.toml";
const MIN_RSA_KEY_SIZE: u32 = 2048;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CaConfig {
    #[serde(default)]
    pub ca: CaSettings,
    #[serde(default)]
    pub subject: SubjectDefaults,
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub crl: CrlSettings,
    #[serde(default)]
    pub pkcs12: Pkcs12Settings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaSettings {
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    /// Leaf certificates and the CRL are signed by the intermediate when one exists.
    #[serde(default)]
    pub use_intermediate: bool,
    #[serde(default = "default_root_validity")]
    pub root_validity_days: u32,
    #[serde(default = "default_intermediate_validity")]
    pub intermediate_validity_days: u32,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            key_size: default_key_size(),
            use_intermediate: false,
            root_validity_days: default_root_validity(),
            intermediate_validity_days: default_intermediate_validity(),
        }
    }
}

fn default_key_size() -> u32 {
    2048
}

fn default_root_validity() -> u32 {
    3650 // 10 years
}

fn default_intermediate_validity() -> u32 {
    1825
}

/// Distinguished name fields shared by every certificate this CA issues.
#[derive(Debug, Deserialize, Clone)]
pub struct SubjectDefaults {
    #[serde(default = "default_root_cn")]
    pub root_common_name: String,
    #[serde(default = "default_intermediate_cn")]
    pub intermediate_common_name: String,
    #[serde(default = "default_org")]
    pub organization: String,
    #[serde(default)]
    pub organizational_unit: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub email: String,
}

impl Default for SubjectDefaults {
    fn default() -> Self {
        Self {
            root_common_name: default_root_cn(),
            intermediate_common_name: default_intermediate_cn(),
            organization: default_org(),
            organizational_unit: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            email: String::new(),
        }
    }
}

fn default_root_cn() -> String {
    "VPN Fleet Root CA".to_string()
}

fn default_intermediate_cn() -> String {
    "VPN Fleet Intermediate CA".to_string()
}

fn default_org() -> String {
    "VPN Fleet".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Pem,
    Der,
}

impl ExportFormat {
    pub fn certificate_extension(self) -> &'static str {
        match self {
            ExportFormat::Pem => "crt",
            ExportFormat::Der => "der",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportSettings {
    #[serde(default = "default_export_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default = "default_crl_file_name")]
    pub crl_file_name: String,
    #[serde(default = "default_chain_file_name")]
    pub chain_file_name: String,
    /// Write root/intermediate private keys next to their certificates.
    #[serde(default)]
    pub export_ca_key: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            root: default_export_root(),
            format: ExportFormat::default(),
            crl_file_name: default_crl_file_name(),
            chain_file_name: default_chain_file_name(),
            export_ca_key: false,
        }
    }
}

fn default_export_root() -> PathBuf {
    PathBuf::from("exports")
}

fn default_crl_file_name() -> String {
    "crl.pem".to_string()
}

fn default_chain_file_name() -> String {
    "ca-chain.crt".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrlSettings {
    #[serde(default = "default_crl_validity")]
    pub validity_days: u32,
}

impl Default for CrlSettings {
    fn default() -> Self {
        Self {
            validity_days: default_crl_validity(),
        }
    }
}

fn default_crl_validity() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PasswordPolicy {
    #[default]
    None,
    /// One configured password protects every bundle.
    Single,
    PerCertificate,
}

/// How the PKCS#12 password is kept next to the stored bundle.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PasswordStorage {
    None,
    Plain,
    #[default]
    Sha256,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Pkcs12Settings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub password_policy: PasswordPolicy,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_storage: PasswordStorage,
}

impl CaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: CaConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration with default path (vpn-pki.toml)
    pub fn load() -> Result<Self> {
        Self::from_file(DEFAULT_CONFIG_PATH)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ca.key_size < MIN_RSA_KEY_SIZE {
            bail!(
                "RSA key size {} is below the minimum of {}",
                self.ca.key_size,
                MIN_RSA_KEY_SIZE
            );
        }
        if self.pkcs12.password_policy == PasswordPolicy::Single && self.pkcs12.password.is_none()
        {
            bail!("pkcs12.password_policy = \"single\" requires pkcs12.password");
        }
        if self.export.crl_file_name.contains(std::path::MAIN_SEPARATOR) {
            bail!("export.crl_file_name must be a bare file name");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: CaConfig = toml::from_str("").unwrap();
        assert_eq!(config.ca.key_size, 2048);
        assert_eq!(config.export.crl_file_name, "crl.pem");
        assert_eq!(config.export.format, ExportFormat::Pem);
        assert_eq!(config.subject.root_common_name, "VPN Fleet Root CA");
        assert!(!config.pkcs12.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let config: CaConfig = toml::from_str(
            r#"
            [ca]
            key_size = 4096
            use_intermediate = true

            [export]
            root = "/srv/vpn"
            format = "der"

            [pkcs12]
            enabled = true
            password_policy = "single"
            password = "fleet"
            password_storage = "plain"
            "#,
        )
        .unwrap();
        assert_eq!(config.ca.key_size, 4096);
        assert!(config.ca.use_intermediate);
        assert_eq!(config.export.root, PathBuf::from("/srv/vpn"));
        assert_eq!(config.export.format.certificate_extension(), "der");
        assert_eq!(config.pkcs12.password_policy, PasswordPolicy::Single);
        assert_eq!(config.pkcs12.password_storage, PasswordStorage::Plain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_weak_keys_and_missing_password() {
        let mut config = CaConfig::default();
        config.ca.key_size = 1024;
        assert!(config.validate().is_err());

        let mut config = CaConfig::default();
        config.pkcs12.password_policy = PasswordPolicy::Single;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(CaConfig::from_file("/nonexistent/vpn-pki.toml").is_err());
    }
}
