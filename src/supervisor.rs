//! Lifecycle orchestration: identity, registration, session, proxy,
//! reconnect, and shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use loophole_auth::TokenStore;
use loophole_cert::CertificateProvider;
use loophole_transport::{dial_with_retry, Credential, DIAL_ATTEMPTS, DIAL_RETRY_DELAY};
use tracing::{error, info, warn};

use crate::acceptor::{self, ANY_SUCCESSFUL_CONNECTION};
use crate::config::Config;
use crate::identity;
use crate::register::{RegistrationClient, SiteSpecification, NOT_LOGGED_IN, TOKEN_UNREADABLE};
use crate::{proxy, terminal};

/// DNS suffix of assigned public hostnames.
pub const GATEWAY_SITE_DOMAIN: &str = "loophole.site";

/// Gateway-side bind address for the remote listener. Meaningful to the
/// gateway only; it maps the public hostname's traffic onto this listener.
const REMOTE_BIND_ADDR: &str = "127.0.0.1:80";

/// Run the tunnel until a fatal error. Signal-driven shutdown exits the
/// process directly from the handler task.
pub async fn run(config: Config) -> anyhow::Result<()> {
    spawn_signal_handler();
    print_welcome();

    let home = dirs::home_dir().context("Failed to resolve the home directory")?;
    let state_dir = home.join(".loophole");
    let tokens = TokenStore::at(&state_dir);
    let registration = RegistrationClient::new();

    // The identity file is read at most once and the passphrase prompted at
    // most once; reconnects reuse this credential.
    let identity_file = config.identity_file.clone();
    let credential: Credential =
        tokio::task::spawn_blocking(move || identity::load(&identity_file))
            .await
            .context("Identity loader failed")??;

    info!("Registering your domain...");
    let site = register_or_fail(
        &registration,
        &tokens,
        &credential,
        config.site_id.as_deref(),
    )
    .await?;

    let gateway_addr = config.gateway.to_string();
    let mut session = dial_with_retry(
        &gateway_addr,
        &site.site_id,
        &credential,
        DIAL_ATTEMPTS,
        DIAL_RETRY_DELAY,
    )
    .await
    .context("Dialing the gateway failed")?;
    let mut listener = session
        .open_remote_listener(REMOTE_BIND_ADDR)
        .await
        .context("Listening on the remote endpoint failed")?;

    // Certificate provider and local proxy are built once and survive
    // reconnects; only the gateway session is rebuilt.
    let provider = Arc::new(CertificateProvider::new(
        &site.site_id,
        GATEWAY_SITE_DOMAIN,
        state_dir.join("certs"),
    ));
    let proxied_endpoint = proxy::start(config.local.to_string(), provider)
        .await
        .context("Failed to start the local TLS proxy")?;

    print_forwarding(&config, &site.site_id);
    info!("Awaiting connections...");

    loop {
        acceptor::accept_loop(&mut listener, proxied_endpoint).await;

        // The gateway dropped the transport. Close the old session before a
        // replacement is dialed, keep the sticky site identifier, and leave
        // the proxy and certificates alone.
        info!("Connection dropped, reconnecting...");
        session.close().await;

        info!("Trying to reuse old hostname...");
        session = dial_with_retry(
            &gateway_addr,
            &site.site_id,
            &credential,
            DIAL_ATTEMPTS,
            DIAL_RETRY_DELAY,
        )
        .await
        .context("Dialing the gateway failed")?;
        listener = session
            .open_remote_listener(REMOTE_BIND_ADDR)
            .await
            .context("Listening on the remote endpoint failed")?;

        info!("Awaiting connections...");
    }
}

/// Map registration result codes onto supervisor actions. Everything except
/// success is fatal with guidance; the 401 refresh-and-retry already
/// happened inside the client.
async fn register_or_fail(
    registration: &RegistrationClient,
    tokens: &TokenStore,
    credential: &Credential,
    requested_site_id: Option<&str>,
) -> anyhow::Result<SiteSpecification> {
    let spec = registration
        .register(tokens, credential.public_key(), requested_site_id)
        .await
        .context("Failed to register site")?;

    match spec.result_code {
        code if (200..300).contains(&code) && !spec.site_id.is_empty() => {
            info!("Site {} registered", spec.site_id);
            Ok(spec)
        }
        400 => {
            error!("The given hostname didn't match the requirements:");
            error!("- Starts with a letter");
            error!("- Contains only small letters and numbers");
            error!("- Minimum 6 characters (not applicable for premium users)");
            bail!("Please fix the issue and try again")
        }
        401 => bail!("Failed to register site, try logging in again"),
        403 => bail!("You don't have the required permissions to establish a tunnel with the given parameters"),
        409 => bail!("The given hostname is already taken by a different user"),
        NOT_LOGGED_IN | TOKEN_UNREADABLE => {
            bail!("Looks like you're not logged in, please run 'loophole login' first")
        }
        other => bail!(
            "Something unexpected happened (result code {}), please let the developers know",
            other
        ),
    }
}

fn spawn_signal_handler() {
    tokio::spawn(async {
        wait_for_shutdown_signal().await;
        terminal::restore();
        print_farewell();
        std::process::exit(0);
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_welcome() {
    println!("Loophole - End to end TLS encrypted TCP communication between you and your clients");
    println!();
}

fn print_farewell() {
    println!();
    println!("Goodbye!");
    if ANY_SUCCESSFUL_CONNECTION.load(Ordering::Relaxed) {
        println!("Thank you for using Loophole. Please give us your feedback via https://forms.gle/K9ga7FZB3deaffnV7 and help us improve our services.");
    }
}

fn print_forwarding(config: &Config, site_id: &str) {
    let public_url = format!("https://{}.{}", site_id, GATEWAY_SITE_DOMAIN);

    println!();
    println!("Forwarding {} -> {}", public_url, config.local);
    if config.qr {
        render_qr(&public_url);
    }
    println!("TLS certificate will be obtained with the first request to the above address, therefore the first execution may be slower");
    println!();
    println!("Press CTRL + C to stop the service");
    println!();
    println!("Logs:");
}

fn render_qr(url: &str) {
    match qrcode::QrCode::new(url) {
        Ok(code) => {
            let rendered = code
                .render::<qrcode::render::unicode::Dense1x2>()
                .quiet_zone(true)
                .build();
            println!("{}", rendered);
        }
        Err(err) => warn!("Failed to render QR code: {}", err),
    }
}
