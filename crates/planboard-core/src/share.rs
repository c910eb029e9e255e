use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::model::AppState;

pub const MAX_DECODED_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("token is not valid base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("token payload could not be inflated: {0}")]
    Inflate(#[from] std::io::Error),

    #[error("token payload exceeds the 8 MiB limit")]
    TooLarge,

    #[error("token payload is not a valid state: {0}")]
    Json(#[from] serde_json::Error),
}

#[tracing::instrument(skip(state), fields(tasks = state.tasks.len(), owners = state.owners.len()))]
pub fn encode_token(state: &AppState) -> Result<String, ShareError> {
    let json = serde_json::to_vec(state)?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    let token = URL_SAFE_NO_PAD.encode(compressed);
    debug!(json_bytes = json.len(), token_len = token.len(), "encoded share token");
    Ok(token)
}

#[tracing::instrument(skip(token), fields(len = token.len()))]
pub fn decode_token(token: &str) -> Result<AppState, ShareError> {
    let compressed = URL_SAFE_NO_PAD.decode(token.trim())?;
    let mut json = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_DECODED_BYTES + 1)
        .read_to_end(&mut json)?;
    if json.len() as u64 > MAX_DECODED_BYTES {
        return Err(ShareError::TooLarge);
    }
    Ok(serde_json::from_slice(&json)?)
}

pub fn share_url(base: &Url, param: &str, token: &str) -> Url {
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != param)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut url = base.clone();
    url.set_query(None);
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(param, token);
    }
    url
}

pub fn token_from_url(url: &Url, param: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == param)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.trim().is_empty())
}
