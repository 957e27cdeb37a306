//! Crawl pipeline: site parsers, the two-phase crawler and its scheduler and
//! retry adapters.

mod crawler;
mod job;
mod parser;

pub use crawler::{CrawlReport, CrawlerConfig, StatsCrawler, TEAM_JOB_TYPE};
pub use job::{CrawlJob, CrawlRetryHandler};
pub use parser::{
    CrawlTarget, FetchError, FetchRetry, ParsedItem, Segment, SiteParser, TeamRef,
};

#[cfg(test)]
pub(crate) use crawler::test_support;
