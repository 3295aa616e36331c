//! Paged, retried bulk reads of ledger records.

use futures::{StreamExt as _, TryStreamExt as _, stream};
use thiserror::Error;

use crate::{
    config::SettlementConfig,
    ledger::{LedgerReader, RemoteError},
    types::{AccountId, Record},
    util::retry::{RetryPolicy, retry_classified},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "failed to fetch page {page} (keys {first}..{end}) after {attempts} attempts"
    )]
    PageExhausted {
        page: usize,
        first: usize,
        end: usize,
        attempts: u32,
        #[source]
        source: RemoteError,
    },
}

/// Resolves long key lists into records, one remote read per page.
#[derive(Debug)]
pub struct AccountFetcher<'a, R> {
    reader: &'a R,
    page_size: usize,
    chunk_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
}

impl<'a, R> AccountFetcher<'a, R>
where
    R: LedgerReader,
{
    pub fn new(reader: &'a R, config: &SettlementConfig) -> Self {
        Self {
            reader,
            page_size: config.page_size.max(1),
            chunk_size: config.chunk_size.max(1),
            concurrency: config.fetch_concurrency.max(1),
            retry: config.fetch_retry,
        }
    }

    /// Read one page. A key without a record is retried like a transient
    /// failure; once the budget is spent it fails the page unless
    /// `allow_missing` is set, in which case it comes back as `None`.
    async fn fetch_page(
        &self,
        page: usize,
        keys: &[AccountId],
        allow_missing: bool,
    ) -> Result<Vec<Option<Record>>, Error> {
        let first = page * self.page_size;
        let end = first + keys.len();
        let max_attempts = self.retry.max_attempts.max(1);
        tracing::debug!(page, "pulling records {first}..{end}");
        let mut attempts = 0;
        let res = retry_classified(&self.retry, "fetch page", |attempt| {
            attempts = attempt;
            async move {
                let data = self.reader.get_multiple_accounts(keys).await?;
                if data.len() != keys.len() {
                    return Err(RemoteError::Transient(format!(
                        "ledger returned {} records for {} keys",
                        data.len(),
                        keys.len()
                    )));
                }
                if allow_missing && attempt >= max_attempts {
                    return Ok(data);
                }
                match data.iter().position(Option::is_none) {
                    Some(idx) => Err(RemoteError::NotFound { key: keys[idx] }),
                    None => Ok(data),
                }
            }
        })
        .await;
        let data = res.map_err(|source| {
            tracing::error!(page, "giving up on records {first}..{end}: {source}");
            Error::PageExhausted {
                page,
                first,
                end,
                attempts,
                source,
            }
        })?;
        Ok(keys
            .iter()
            .zip(data)
            .map(|(key, data)| match data {
                Some(data) => Some(Record { key: *key, data }),
                None => {
                    tracing::warn!(%key, "record still missing, skipping it");
                    None
                }
            })
            .collect())
    }

    async fn fetch_pages(
        &self,
        keys: &[AccountId],
        allow_missing: bool,
    ) -> Result<Vec<Option<Record>>, Error> {
        let mut records = Vec::with_capacity(keys.len());
        let mut pages = stream::iter(keys.chunks(self.page_size).enumerate())
            .map(|(page, keys)| self.fetch_page(page, keys, allow_missing))
            .buffered(self.concurrency);
        let mut reported = 0;
        while let Some(page) = pages.try_next().await? {
            records.extend(page);
            if records.len() / self.chunk_size > reported
                || records.len() == keys.len()
            {
                reported = records.len() / self.chunk_size;
                tracing::info!("fetched {}/{} records", records.len(), keys.len());
            }
        }
        Ok(records)
    }

    /// Fetch every key. The result is in key order; a page that exhausts
    /// its retry budget fails the whole call, and so does a key whose
    /// record never appears.
    pub async fn fetch_many(
        &self,
        keys: &[AccountId],
    ) -> Result<Vec<Record>, Error> {
        let records = self.fetch_pages(keys, false).await?;
        Ok(records.into_iter().flatten().collect())
    }

    /// Like [`Self::fetch_many`], but a record still missing after the
    /// retry budget is logged and returned as `None` in its slot.
    pub async fn fetch_many_lenient(
        &self,
        keys: &[AccountId],
    ) -> Result<Vec<Option<Record>>, Error> {
        self.fetch_pages(keys, true).await
    }
}
