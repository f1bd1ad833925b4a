//! VPN gateway TLS core utility

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use vpngw_core::ValidateConfig;
use vpngw_core::tracing::{InstrumentationConfig, init_tracing};
use vpngw_tls::fingerprint::{FingerprintInput, fingerprint_file};
use vpngw_tls::{Credentials, TlsConfig, TracingLog};

/// VPN gateway TLS core utility - fingerprints and credential checks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the SHA-1 fingerprint of a file as uppercase hex
    Fingerprint {
        /// File to fingerprint
        file: PathBuf,

        /// Fingerprint the DER encoding of the certificate in FILE (PEM or DER)
        #[arg(long)]
        cert: bool,
    },

    /// Load the configured credentials and report what would be served
    Check {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Fingerprint { file, cert } => {
            let input = if cert {
                FingerprintInput::Certificate
            } else {
                FingerprintInput::RawFile
            };
            let fingerprint = fingerprint_file(&file, input)
                .with_context(|| format!("failed to fingerprint {}", file.display()))?;
            println!("{fingerprint}");
        }
        Command::Check { config } => check(config)?,
    }

    Ok(())
}

fn check(config_path: Option<PathBuf>) -> Result<()> {
    let config = match &config_path {
        Some(path) => TlsConfig::load_from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => TlsConfig::load().context("failed to load configuration")?,
    };

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if config.debug > 0 { "debug" } else { "info" }.to_string()
    });
    init_tracing(&InstrumentationConfig::for_service("vpngw-tls", log_level))?;

    config.validate().context("invalid configuration")?;

    let credentials = Credentials::load(&config, TracingLog::from_debug_level(config.debug).shared())
        .context("failed to load credentials")?;

    for chain in credentials.chains() {
        info!(
            key = %chain.index(),
            cert = %chain.source().display(),
            certificates = chain.certs().len(),
            algorithm = ?chain.key().algorithm(),
            ocsp = chain.certified_key().ocsp.is_some(),
            "certificate chain"
        );
    }

    let versions: Vec<String> = credentials
        .priority()
        .protocol_versions()
        .iter()
        .map(|v| format!("{:?}", v.version))
        .collect();
    let suites: Vec<String> = credentials
        .priority()
        .cipher_suites()
        .iter()
        .map(|s| format!("{:?}", s.suite()))
        .collect();
    info!(
        versions = %versions.join(","),
        suites = %suites.join(","),
        server_precedence = credentials.priority().server_precedence(),
        "priority policy"
    );
    info!(
        cert_req = ?credentials.cert_req(),
        ca_certificates = credentials.ca_count(),
        crls = credentials.crls().len(),
        cisco_client_compat = credentials.client_auth_policy().cisco_client_compat,
        dh_bits = credentials.dh_params().map(|dh| dh.prime_bits()),
        "client authentication"
    );

    println!(
        "{} certificate chain(s) loaded, key indices 0..{}",
        credentials.chains().len(),
        credentials.chains().len()
    );
    Ok(())
}
