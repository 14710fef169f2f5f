use std::{
    fs,
    io::Read as _,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};
use base64::{prelude::BASE64_STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use shaml_sp::{
    generate_keypair, KeyLength, RedirectEncoding, ServiceProvider, ServiceProviderConfig,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Parser, Debug)]
#[command(term_width = 0, version, name = "shaml-sp")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a private key and self-signed certificate.
    Keygen {
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 2048)]
        bits: u32,
        #[arg(long, default_value = "saml-sp")]
        common_name: String,
    },
    /// Print SP metadata.
    Metadata {
        #[arg(short, long, env = "SHAML_SP_CONFIG")]
        config: PathBuf,
    },
    /// Print the IdP redirect URL carrying a fresh AuthnRequest.
    LoginUrl {
        #[arg(short, long, env = "SHAML_SP_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        idp_url: String,
        #[arg(long)]
        relay_state: Option<String>,
        /// DEFLATE the request before base64 encoding it.
        #[arg(long)]
        deflate: bool,
    },
    /// Run a SAML response through the ingestion pipeline and print the result as JSON.
    Inspect {
        #[arg(short, long, env = "SHAML_SP_CONFIG")]
        config: PathBuf,
        /// Response file; stdin when omitted.
        response: Option<PathBuf>,
        /// The input is the base64 `SAMLResponse` value rather than XML.
        #[arg(long)]
        base64: bool,
        /// Check the validity window at this RFC 3339 instant instead of now.
        #[arg(long)]
        at: Option<String>,
    },
}

fn init_logger(json: bool) {
    let builder = SubscriberBuilder::default()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn service_provider(config: &Path) -> Result<ServiceProvider> {
    let config = ServiceProviderConfig::load(config)
        .with_context(|| format!("failed to load {}", config.display()))?;
    Ok(ServiceProvider::new(config)?)
}

fn read_response(path: Option<&Path>, base64: bool) -> Result<String> {
    let raw = match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            input
        }
    };
    if !base64 {
        return Ok(raw);
    }
    let compact: String = raw.split_whitespace().collect();
    let decoded = BASE64_STANDARD.decode(compact).context("response is not valid base64")?;
    String::from_utf8(decoded).context("response is not UTF-8")
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Keygen {
            out_dir,
            bits,
            common_name,
        } => {
            let length = KeyLength::try_from(bits).map_err(anyhow::Error::msg)?;
            let keypair = generate_keypair(length, &common_name)?;
            let (key, cert) = keypair.write_pem_files(&out_dir)?;
            println!("{}\n{}", key.display(), cert.display());
        }
        Command::Metadata { config } => {
            println!("{}", service_provider(&config)?.metadata()?);
        }
        Command::LoginUrl {
            config,
            idp_url,
            relay_state,
            deflate,
        } => {
            let encoding = if deflate {
                RedirectEncoding::Deflate
            } else {
                RedirectEncoding::Base64
            };
            let context = service_provider(&config)?.authn_request(&idp_url)?;
            println!("{}", context.create_authn_url_with(encoding, relay_state.as_deref())?);
        }
        Command::Inspect {
            config,
            response,
            base64,
            at,
        } => {
            let sp = service_provider(&config)?;
            let xml = read_response(response.as_deref(), base64)?;
            let now = match at {
                Some(at) => OffsetDateTime::parse(&at, &Rfc3339)
                    .with_context(|| format!("invalid instant {at:?}"))?,
                None => OffsetDateTime::now_utc(),
            };
            match sp.process_xml_at(&xml, now)? {
                Some(assertion) => println!("{}", serde_json::to_string_pretty(&assertion)?),
                None => bail!("response carries no assertion"),
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.json_logs);
    run(cli.command)
}
