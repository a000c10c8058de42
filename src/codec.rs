//! Response body compression (spec §4.2): zstd, with per-continuation
//! trained dictionaries, operator-initiated training and re-compression.

use thiserror::Error;

use crate::model::CompressionDict;
use crate::store::{Store, StoreError};

/// Default compression level for dictionary-less/first-pass compression.
const ZSTD_LEVEL: i32 = 3;

/// Default `train` sample cap and dictionary size (zstd's own default of
/// 112640 bytes / 110KB), per spec §4.2 `train(continuation, sample_limit,
/// dict_size)`. Operators can override both via the CLI.
pub const DEFAULT_SAMPLE_LIMIT: i64 = 100;
pub const DEFAULT_DICT_SIZE: usize = 112_640;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("zstd error: {0}")]
    Zstd(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no responses found for continuation '{0}'")]
    NoSamples(String),

    #[error("could not decompress any sample for continuation '{0}'")]
    AllSamplesUndecodable(String),

    #[error("no dictionary found for continuation '{0}'")]
    NoDictionary(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Compress `content` for `continuation`, using that continuation's latest
/// trained dictionary if one exists. Returns the compressed bytes and the
/// dictionary id used, if any.
pub async fn compress_response(
    store: &Store,
    continuation: &str,
    content: &[u8],
) -> CodecResult<(Vec<u8>, Option<i64>)> {
    match store.latest_compression_dict(continuation).await? {
        Some(dict) => {
            let compressed = compress_with_dict(content, &dict.dict_bytes)?;
            Ok((compressed, Some(dict.id)))
        }
        None => Ok((compress_plain(content)?, None)),
    }
}

/// Decompress a stored response body, given the dictionary it was encoded
/// with (if any — `dict_id` comes from `responses.compression_dict_id`).
pub async fn decompress_response(
    store: &Store,
    content_compressed: &[u8],
    dict_id: Option<i64>,
) -> CodecResult<Vec<u8>> {
    match dict_id {
        Some(id) => {
            let dict = store
                .get_compression_dict(id)
                .await?
                .ok_or(StoreError::NoSuchRow)?;
            Ok(decompress_with_dict(content_compressed, &dict.dict_bytes)?)
        }
        None => Ok(zstd::stream::decode_all(content_compressed)?),
    }
}

fn compress_plain(content: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::encode_all(content, ZSTD_LEVEL)
}

fn compress_with_dict(content: &[u8], dict: &[u8]) -> std::io::Result<Vec<u8>> {
    compress_with_dict_at_level(content, dict, ZSTD_LEVEL)
}

fn compress_with_dict_at_level(content: &[u8], dict: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    let mut encoder = zstd::stream::Encoder::with_dictionary(Vec::new(), level, dict)?;
    std::io::Write::write_all(&mut encoder, content)?;
    encoder.finish()
}

fn decompress_with_dict(content: &[u8], dict: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = zstd::stream::Decoder::with_dictionary(content, dict)?;
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut out)?;
    Ok(out)
}

/// Spec §4.2 `train(continuation, sample_limit, dict_size)`: sample up to
/// `sample_limit` un-dictionaried responses for `continuation`, decompress
/// them to raw bytes, train a `dict_size`-byte zstd dictionary from the
/// corpus, and persist it as the next version. Fails if no responses exist
/// or none of the sampled responses can be decompressed.
pub async fn train(
    store: &Store,
    continuation: &str,
    sample_limit: i64,
    dict_size: usize,
) -> CodecResult<CompressionDict> {
    let samples = store.responses_without_dict(continuation, sample_limit).await?;
    if samples.is_empty() {
        return Err(CodecError::NoSamples(continuation.to_string()));
    }

    let mut raw_samples = Vec::with_capacity(samples.len());
    for s in &samples {
        if let Ok(raw) = zstd::stream::decode_all(s.content_compressed.as_slice()) {
            raw_samples.push(raw);
        }
    }
    if raw_samples.is_empty() {
        return Err(CodecError::AllSamplesUndecodable(continuation.to_string()));
    }

    let dict_bytes = zstd::dict::from_samples(&raw_samples, dict_size)?;

    let next_version = match store.latest_compression_dict(continuation).await? {
        Some(existing) => existing.version + 1,
        None => 1,
    };

    let dict_id = store
        .store_compression_dict(continuation, next_version, samples.len() as i64, &dict_bytes)
        .await?;

    Ok(store
        .get_compression_dict(dict_id)
        .await?
        .ok_or(StoreError::NoSuchRow)?)
}

/// Spec §4.2 `recompress(continuation, level, dict_id?)`: decompress every
/// response for `continuation` with its recorded dictionary, re-compress
/// against the target dictionary (explicit `dict_id`, or the continuation's
/// latest if `None`) at `level`, and update the row. Reports
/// `(count, original_bytes, compressed_bytes)`.
pub async fn recompress(
    store: &Store,
    continuation: &str,
    level: i32,
    dict_id: Option<i64>,
) -> CodecResult<(u64, u64, u64)> {
    let target_dict = match dict_id {
        Some(id) => store.get_compression_dict(id).await?.ok_or(StoreError::NoSuchRow)?,
        None => store
            .latest_compression_dict(continuation)
            .await?
            .ok_or_else(|| CodecError::NoDictionary(continuation.to_string()))?,
    };

    let mut count = 0u64;
    let mut original_bytes = 0u64;
    let mut compressed_bytes = 0u64;
    for response in store.responses_for_continuation(continuation).await? {
        let raw = match response.compression_dict_id {
            Some(id) => {
                let dict = store.get_compression_dict(id).await?.ok_or(StoreError::NoSuchRow)?;
                decompress_with_dict(&response.content_compressed, &dict.dict_bytes)?
            }
            None => zstd::stream::decode_all(response.content_compressed.as_slice())?,
        };
        let recompressed = compress_with_dict_at_level(&raw, &target_dict.dict_bytes, level)?;
        store
            .update_response_compression(response.request_id, &recompressed, Some(target_dict.id))
            .await?;
        count += 1;
        original_bytes += raw.len() as u64;
        compressed_bytes += recompressed.len() as u64;
    }
    Ok((count, original_bytes, compressed_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_round_trips_without_dictionary() {
        let store = Store::open_in_memory().await.unwrap();
        let content = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let (compressed, dict_id) = compress_response(&store, "parse", &content).await.unwrap();
        assert!(dict_id.is_none());
        assert!(compressed.len() < content.len());
        let decompressed = decompress_response(&store, &compressed, dict_id).await.unwrap();
        assert_eq!(decompressed, content);
    }

    #[tokio::test]
    async fn training_fails_with_no_responses() {
        let store = Store::open_in_memory().await.unwrap();
        let err = train(&store, "parse", DEFAULT_SAMPLE_LIMIT, DEFAULT_DICT_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::NoSamples(c) if c == "parse"));
    }

    async fn seed_responses(store: &Store, continuation: &str, count: usize) {
        for i in 0..count {
            let request_id = store
                .insert_request(crate::model::NewRequest {
                    url: format!("https://x/{i}"),
                    continuation: continuation.to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            let content = format!("sample body number {i}").repeat(10).into_bytes();
            let (compressed, _) = compress_response(store, continuation, &content).await.unwrap();
            store
                .store_response(
                    request_id,
                    200,
                    &Default::default(),
                    "https://x",
                    &compressed,
                    content.len() as i64,
                    None,
                    continuation,
                    None,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn training_caps_sample_count_at_sample_limit() {
        let store = Store::open_in_memory().await.unwrap();
        seed_responses(&store, "parse", 5).await;
        let dict = train(&store, "parse", 3, 32 * 1024).await.unwrap();
        assert_eq!(dict.version, 1);
        assert_eq!(dict.sample_count, 3);
    }

    #[tokio::test]
    async fn recompress_reports_byte_totals_and_rewrites_dict_id() {
        let store = Store::open_in_memory().await.unwrap();
        seed_responses(&store, "parse", 4).await;
        let dict = train(&store, "parse", DEFAULT_SAMPLE_LIMIT, 32 * 1024).await.unwrap();

        let (count, original_bytes, compressed_bytes) =
            recompress(&store, "parse", ZSTD_LEVEL, Some(dict.id)).await.unwrap();
        assert_eq!(count, 4);
        assert!(original_bytes > 0);
        assert!(compressed_bytes > 0);

        let response = store.get_response(1).await.unwrap().unwrap();
        assert_eq!(response.compression_dict_id, Some(dict.id));
    }

    #[tokio::test]
    async fn recompress_fails_without_a_dictionary() {
        let store = Store::open_in_memory().await.unwrap();
        seed_responses(&store, "parse", 1).await;
        let err = recompress(&store, "parse", ZSTD_LEVEL, None).await.unwrap_err();
        assert!(matches!(err, CodecError::NoDictionary(c) if c == "parse"));
    }
}
