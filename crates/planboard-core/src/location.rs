use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use url::Url;

use crate::share::{share_url, token_from_url};

pub trait StateLocation: Send + Sync {
    fn read_token(&self) -> anyhow::Result<Option<String>>;

    fn write_token(&self, token: &str) -> anyhow::Result<()>;

    fn current_url(&self) -> anyhow::Result<Url>;
}

#[derive(Debug)]
pub struct MemoryLocation {
    url: Mutex<Url>,
    param: String,
}

impl MemoryLocation {
    pub fn new(url: Url, param: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url),
            param: param.into(),
        }
    }
}

impl StateLocation for MemoryLocation {
    fn read_token(&self) -> anyhow::Result<Option<String>> {
        Ok(token_from_url(&self.url.lock(), &self.param))
    }

    fn write_token(&self, token: &str) -> anyhow::Result<()> {
        let mut url = self.url.lock();
        *url = share_url(&url, &self.param, token);
        Ok(())
    }

    fn current_url(&self) -> anyhow::Result<Url> {
        Ok(self.url.lock().clone())
    }
}

#[derive(Debug)]
pub struct UrlFileLocation {
    pub path: PathBuf,
    base_url: Url,
    param: String,
}

impl UrlFileLocation {
    #[tracing::instrument(skip(data_dir, base_url))]
    pub fn open(data_dir: &Path, base_url: Url, param: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let path = data_dir.join("state.url");
        info!(path = %path.display(), base = %base_url, "opened url location");
        Ok(Self {
            path,
            base_url,
            param: param.to_string(),
        })
    }

    fn load_url(&self) -> anyhow::Result<Option<Url>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading {}", self.path.display()))?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let url = Url::parse(trimmed)
            .with_context(|| format!("{} does not hold a valid url", self.path.display()))?;
        Ok(Some(url))
    }
}

impl StateLocation for UrlFileLocation {
    fn read_token(&self) -> anyhow::Result<Option<String>> {
        Ok(self
            .load_url()?
            .and_then(|url| token_from_url(&url, &self.param)))
    }

    #[tracing::instrument(skip(self, token), fields(path = %self.path.display(), len = token.len()))]
    fn write_token(&self, token: &str) -> anyhow::Result<()> {
        // A damaged file is overwritten from the configured base.
        let base = self
            .load_url()
            .ok()
            .flatten()
            .unwrap_or_else(|| self.base_url.clone());
        let url = share_url(&base, &self.param, token);

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        writeln!(temp, "{url}")?;
        temp.flush()?;
        temp.persist(&self.path)
            .map_err(|err| anyhow!("failed to persist {}: {}", self.path.display(), err))?;

        debug!(url_len = url.as_str().len(), "persisted share url");
        Ok(())
    }

    fn current_url(&self) -> anyhow::Result<Url> {
        Ok(self.load_url()?.unwrap_or_else(|| self.base_url.clone()))
    }
}
