pub mod account_map;
pub mod document_scraper;
pub mod statement_parser;

pub use document_scraper::{parse_filing_document, scrape_annual_financials};
pub use statement_parser::{parse_amount, parse_statement};
