//! Environment variable configuration
//!
//! Credentials only ever come from the environment; a few site settings
//! can be overridden the same way.

use std::env;

use crate::pve::Credentials;

/// Environment variable prefix
const ENV_PREFIX: &str = "PVE_CTL";

const USER_VAR: &str = "PROXMOX_USER";
const PASSWORD_VAR: &str = "PROXMOX_PW";
const TOKEN_ID_VAR: &str = "PROXMOX_TOKEN_ID";
const TOKEN_SECRET_VAR: &str = "PROXMOX_TOKEN_SECRET";

/// Configuration read from environment variables
#[derive(Clone, Default)]
pub struct EnvConfig {
    /// API user from PROXMOX_USER
    pub user: Option<String>,
    /// Password from PROXMOX_PW
    pub password: Option<String>,
    /// API token id from PROXMOX_TOKEN_ID
    pub token_id: Option<String>,
    /// API token secret from PROXMOX_TOKEN_SECRET
    pub token_secret: Option<String>,
    /// Config file from PVE_CTL_CONFIG
    pub config_file: Option<String>,
    /// API host from PVE_CTL_HOST
    pub host: Option<String>,
    /// API port from PVE_CTL_PORT
    pub port: Option<u16>,
    /// Certificate verification from PVE_CTL_VERIFY_TLS
    pub verify_tls: Option<bool>,
    /// Pool from PVE_CTL_POOL
    pub pool: Option<String>,
    /// Log level from PVE_CTL_LOG
    pub log_level: Option<String>,
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("token_id", &self.token_id)
            .field("token_secret", &self.token_secret.as_ref().map(|_| "***"))
            .field("config_file", &self.config_file)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("verify_tls", &self.verify_tls)
            .field("pool", &self.pool)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            user: non_empty(USER_VAR),
            password: non_empty(PASSWORD_VAR),
            token_id: non_empty(TOKEN_ID_VAR),
            token_secret: non_empty(TOKEN_SECRET_VAR),
            config_file: get_env("CONFIG"),
            host: get_env("HOST"),
            port: get_env_parse("PORT"),
            verify_tls: get_env_bool("VERIFY_TLS"),
            pool: get_env("POOL"),
            log_level: get_env("LOG"),
        }
    }

    /// Credentials to use; an API token wins over user and password
    pub fn credentials(&self) -> Option<Credentials> {
        if let (Some(id), Some(secret)) = (&self.token_id, &self.token_secret) {
            return Some(Credentials::Token {
                id: id.clone(),
                secret: secret.clone(),
            });
        }
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            return Some(Credentials::Password {
                user: user.clone(),
                password: password.clone(),
            });
        }
        None
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        let set = |v: &Option<String>| if v.is_some() { "set" } else { "unset" };
        println!("Environment Configuration:");
        println!("  {USER_VAR}:           {:?}", self.user);
        println!("  {PASSWORD_VAR}:             {}", set(&self.password));
        println!("  {TOKEN_ID_VAR}:       {:?}", self.token_id);
        println!("  {TOKEN_SECRET_VAR}:   {}", set(&self.token_secret));
        println!("  {}_CONFIG:       {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_HOST:         {:?}", ENV_PREFIX, self.host);
        println!("  {}_PORT:         {:?}", ENV_PREFIX, self.port);
        println!("  {}_VERIFY_TLS:   {:?}", ENV_PREFIX, self.verify_tls);
        println!("  {}_POOL:         {:?}", ENV_PREFIX, self.pool);
        println!("  {}_LOG:          {:?}", ENV_PREFIX, self.log_level);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables in tests
#[cfg(test)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

#[cfg(test)]
impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    pub fn var(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.push((key.to_string(), value.into()));
        self
    }

    pub fn prefixed(self, name: &str, value: impl Into<String>) -> Self {
        self.var(&format!("{ENV_PREFIX}_{name}"), value)
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
#[cfg(test)]
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

#[cfg(test)]
impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all recognised environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {USER_VAR}            API user, e.g. root@pam");
    println!("  {PASSWORD_VAR}              API password");
    println!("  {TOKEN_ID_VAR}        API token id (user@realm!name), preferred over a password");
    println!("  {TOKEN_SECRET_VAR}    API token secret");
    println!("  {ENV_PREFIX}_CONFIG        Path to configuration file");
    println!("  {ENV_PREFIX}_HOST          Proxmox API host");
    println!("  {ENV_PREFIX}_PORT          Proxmox API port");
    println!("  {ENV_PREFIX}_VERIFY_TLS    Verify the API certificate (true/false)");
    println!("  {ENV_PREFIX}_POOL          Pool holding the distributed VMs");
    println!("  {ENV_PREFIX}_LOG           Log level (trace, debug, info, warn, error)");
    println!();
    println!("Example:");
    println!("  export {USER_VAR}=root@pam");
    println!("  export {PASSWORD_VAR}=...");
    println!("  pve-ctl run");
}
