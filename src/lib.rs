pub mod captcha;
pub mod config;
pub mod document;
pub mod driver;
pub mod ledger;
pub mod portal;
