use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio::runtime::Runtime;
use tracing::{info, warn};
use url::Url;

use crate::chart::TextChart;
use crate::cli::Command;
use crate::config::Settings;
use crate::edit::{EditOutcome, EditTarget, apply_edit, editor_text};
use crate::preload::{HttpImageFetcher, ImagePreloadCache};
use crate::render::{RenderGate, RenderOutcome};
use crate::share::{decode_token, encode_token, share_url, token_from_url};
use crate::store::StateStore;

pub struct Session {
    pub store: Arc<StateStore>,
    pub settings: Settings,
    pub runtime: Runtime,
}

#[tracing::instrument(skip_all)]
pub fn dispatch(session: &Session, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Show { target } => cmd_show(session, target),
        Command::Share => cmd_share(session),
        Command::Open { url } => cmd_open(session, &url),
        Command::Edit { target, file } => cmd_edit(session, target, file.as_deref()),
        Command::Reset => cmd_reset(session),
        Command::Preload => cmd_preload(session),
        Command::Render { width, recover } => cmd_render(session, width, recover),
    }
}

fn cmd_show(session: &Session, target: Option<EditTarget>) -> anyhow::Result<()> {
    let snapshot = session.store.get();
    let mut out = io::stdout().lock();
    match target {
        Some(target) => writeln!(out, "{}", editor_text(&snapshot, target))?,
        None => {
            for target in [EditTarget::Tasks, EditTarget::Owners] {
                writeln!(out, "# {target}")?;
                writeln!(out, "{}", editor_text(&snapshot, target))?;
            }
        }
    }
    Ok(())
}

fn cmd_share(session: &Session) -> anyhow::Result<()> {
    let snapshot = session.store.get();
    let token = encode_token(&snapshot.state).context("failed to encode state")?;
    let base = session.store.location().current_url()?;
    let url = share_url(&base, &session.settings.share_param, &token);
    info!(url_len = url.as_str().len(), "built share link");
    println!("{url}");
    Ok(())
}

fn cmd_open(session: &Session, raw: &str) -> anyhow::Result<()> {
    let url = Url::parse(raw.trim()).with_context(|| format!("not a valid url: {raw}"))?;
    let token = token_from_url(&url, &session.settings.share_param).ok_or_else(|| {
        anyhow!(
            "link carries no `{}` parameter",
            session.settings.share_param
        )
    })?;
    let state = decode_token(&token).context("link does not carry a valid dataset")?;
    let snapshot = session.store.set(state)?;
    println!(
        "loaded {} tasks and {} owners",
        snapshot.state.tasks.len(),
        snapshot.state.owners.len()
    );
    Ok(())
}

fn cmd_edit(session: &Session, target: EditTarget, file: Option<&Path>) -> anyhow::Result<()> {
    let text = match file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed reading stdin")?;
            buf
        }
    };

    match apply_edit(&session.store, target, &text)? {
        EditOutcome::Applied { revision } => {
            println!("updated {target} (revision {revision})");
        }
        EditOutcome::Rejected(error) => {
            eprintln!("{target} not updated: {error}");
        }
    }
    Ok(())
}

fn cmd_reset(session: &Session) -> anyhow::Result<()> {
    session.store.reset()?;
    println!("restored the default dataset");
    Ok(())
}

fn build_gate(
    session: &Session,
    color: bool,
) -> anyhow::Result<(RenderGate<TextChart>, Arc<ImagePreloadCache>)> {
    let fetcher = Arc::new(HttpImageFetcher::new()?);
    let preload = Arc::new(ImagePreloadCache::new(
        fetcher,
        session.settings.preload.clone(),
    ));
    let gate = RenderGate::new(session.store.clone(), preload.clone(), TextChart::new(color));
    Ok((gate, preload))
}

fn settle_wait(session: &Session) -> Duration {
    let snapshot = session.store.get();
    let fetches = snapshot
        .state
        .owners
        .values()
        .filter(|info| info.avatar().is_some())
        .count();
    session.settings.preload.settle_bound(fetches)
}

fn cmd_preload(session: &Session) -> anyhow::Result<()> {
    let (mut gate, preload) = build_gate(session, false)?;
    let wait = settle_wait(session);
    let ready = session.runtime.block_on(gate.wait_ready(wait))?;
    if !ready {
        warn!("avatars did not settle in time");
    }

    let snapshot = session.store.get();
    let cache = preload
        .current()
        .filter(|cache| cache.generation() == snapshot.owners_generation);

    let mut out = io::stdout().lock();
    for (key, info) in &snapshot.state.owners {
        let entry = cache.as_ref().and_then(|cache| cache.get(key));
        let status = match (info.avatar(), entry) {
            (None, _) => "no avatar".to_string(),
            (Some(_), Some(entry)) => {
                format!("{}x{}", entry.natural_width, entry.natural_height)
            }
            (Some(source), None) => format!("unavailable ({source})"),
        };
        writeln!(out, "{key:<16} {status}")?;
    }
    Ok(())
}

fn cmd_render(session: &Session, width: Option<u16>, recover: bool) -> anyhow::Result<()> {
    let width = width.unwrap_or(session.settings.render_width);
    let color = session.settings.color && io::stdout().is_terminal();
    let (mut gate, _preload) = build_gate(session, color)?;
    let wait = settle_wait(session);

    let outcome = session.runtime.block_on(async {
        gate.wait_ready(wait).await?;
        match gate.render(width) {
            RenderOutcome::Fallback { message } if recover => {
                warn!(%message, "render failed; recovering with the default dataset");
                gate.recover()?;
                gate.wait_ready(wait).await?;
                Ok::<_, anyhow::Error>(gate.render(width))
            }
            outcome => Ok::<_, anyhow::Error>(outcome),
        }
    })?;

    match outcome {
        RenderOutcome::Drawn => {
            print!("{}", gate.renderer().output());
            Ok(())
        }
        RenderOutcome::Fallback { message } => {
            eprintln!("Something went wrong:\n{message}");
            eprintln!("Run `planboard render --recover` to reset to the default dataset.");
            Err(anyhow!("chart could not be drawn"))
        }
    }
}
