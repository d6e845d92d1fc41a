mod config;
mod discovery;
mod error;
mod geo;
mod io;
mod models;
mod network;
mod parsers;
mod utils;
mod validate;
mod verify;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, DEFAULT_REGION};
use crate::discovery::extract_urls;
use crate::geo::GeoResolver;
use crate::io::{assemble, fallback_document, gather_text, write_config, write_node_report};
use crate::models::{Country, RegexPatterns};
use crate::network::{build_client, fetch_all, fetch_via_aggregator};
use crate::parsers::{DecodeStats, decode};
use crate::utils::{estimate_fetch_time, estimate_verification_time, format_duration};
use crate::validate::{dedup, validate_all};
use crate::verify::{MihomoRuntime, VerificationEngine, public_ip};

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn write_fallback(args: &Args) -> anyhow::Result<()> {
    let text = fallback_document()?;
    write_config(&args.output, &text)
        .await
        .with_context(|| format!("writing {}", args.output.display()))?;
    warn!("⚠️  Wrote fallback config with no proxies to {}", args.output.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let start_time = Instant::now();

    info!("🚀 Starting subscription aggregation...");

    let region = Country::parse(&args.region).unwrap_or_else(|| {
        warn!("⚠️  Invalid region {:?}, using {}", args.region, DEFAULT_REGION);
        Country::parse(DEFAULT_REGION).unwrap_or_default()
    });
    let patterns = RegexPatterns::new()?;
    let client = build_client()?;

    let raw_text = match gather_text(&args.input).await {
        Ok(text) => text,
        Err(e) => {
            warn!("❌ Cannot read {}: {}", args.input.display(), e);
            return write_fallback(&args).await;
        }
    };
    let urls = extract_urls(&raw_text, &patterns);
    if urls.is_empty() {
        warn!("❌ No subscription URLs found in {}", args.input.display());
        return write_fallback(&args).await;
    }

    let (fetch_eta, expected_nodes) = estimate_fetch_time(urls.len(), args.max_io_workers);
    info!(
        "📊 Found {} URLs - fetch ~{}, up to ~{:.0} candidate nodes",
        urls.len(),
        format_duration(fetch_eta),
        expected_nodes
    );

    // Fetch
    let mut bodies = Vec::new();
    if args.aggregator {
        if let Some(body) = fetch_via_aggregator(&client, &args.aggregator_endpoints(), &urls).await {
            bodies.push(("aggregator".to_string(), body));
        } else {
            info!("↩️  Falling back to direct fetching");
        }
    }
    if bodies.is_empty() {
        bodies = fetch_all(&client, &urls, args.max_io_workers).await;
    }
    info!("✅ Fetched {} of {} subscriptions", bodies.len(), urls.len());

    // Decode
    let mut decode_stats = DecodeStats::default();
    let mut candidates = Vec::new();
    for (url, body) in &bodies {
        let decoded = decode(body, &patterns);
        info!(
            "Decode {} -> {} candidates ({})",
            url,
            decoded.nodes.len(),
            decoded.format.map_or("unrecognised", |f| f.as_str())
        );
        decode_stats.record(&decoded);
        candidates.extend(decoded.nodes);
    }
    info!(
        "🔧 Decoded {} candidates from {} sources ({} skipped entries, {} undecodable sources)",
        decode_stats.candidates, decode_stats.sources, decode_stats.skipped, decode_stats.undecodable
    );

    // Validate + dedup
    let (valid, validation) = validate_all(candidates);
    for (reason, count) in &validation.rejected {
        info!("   rejected {}: {}", reason, count);
    }
    let nodes = dedup(valid);
    info!(
        "🎯 {} valid, {} rejected, {} unique nodes",
        validation.accepted,
        validation.total_rejected(),
        nodes.len()
    );
    if nodes.is_empty() {
        warn!("❌ No usable nodes");
        return write_fallback(&args).await;
    }

    let engine_settings = args.engine_settings();
    let verify_eta = estimate_verification_time(nodes.len(), engine_settings.dial_workers, engine_settings.probe_workers);
    info!("⏱️  Estimated verification time: {}", format_duration(verify_eta));

    // Verify
    let geo = Arc::new(GeoResolver::from_settings(args.geo_settings(), &client).await?);
    let runtime_settings = args.runtime_settings();

    let self_ip = if engine_settings.reject_self_egress {
        let ip = public_ip(&client, &runtime_settings.egress_endpoints).await;
        match ip {
            Some(ip) => info!("🏠 Host egress is {}", ip),
            None => warn!("⚠️  Could not learn host egress, self-egress guard disabled"),
        }
        ip
    } else {
        None
    };

    let runtime = MihomoRuntime::new(runtime_settings, engine_settings.probe_timeout)?;
    let engine = VerificationEngine::new(runtime, geo.clone(), engine_settings).with_self_ip(self_ip);
    let verification = engine.verify(nodes).await;

    let stats = &verification.stats;
    info!(
        "✅ {} alive, {} dead of {} tested ({} TCP-only, {} unreachable before probing)",
        stats.alive, stats.dead, stats.tested, stats.tcp_only, verification.prefilter.unreachable
    );
    let mut countries: Vec<_> = stats.per_country.iter().collect();
    countries.sort_by(|a, b| b.1.cmp(a.1));
    for (country, count) in countries.iter().take(15) {
        info!("   {} {}: {}", country.flag(), country, count);
    }
    info!(
        "🌍 {} hosts geolocated ({})",
        geo.cached_hosts(),
        if geo.has_offline_db() { "with offline database" } else { "no offline database" }
    );

    // Output
    if let Some(path) = &args.report {
        write_node_report(path, &verification.results, stats)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!("📝 Report written to {}", path.display());
    }

    if stats.alive == 0 {
        warn!("❌ No nodes survived verification");
        return write_fallback(&args).await;
    }

    let assembled = assemble(&verification.results, region)?;
    write_config(&args.output, &assembled.text)
        .await
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!(
        "💾 Wrote {} proxies ({} in {}) to {}",
        assembled.proxies,
        assembled.region_proxies,
        region,
        args.output.display()
    );

    info!("🏁 Done! Total time: {}", format_duration(start_time.elapsed().as_secs_f64()));
    Ok(())
}
