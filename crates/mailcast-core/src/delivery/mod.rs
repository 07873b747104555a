//! Rate-limited, retrying email delivery

pub mod mailer;
pub mod rate_limiter;
pub mod retry;
pub mod sendgrid;
pub mod smtp;
pub mod worker;

pub use mailer::{build_mailer, LogMailer, Mailer, OutboundEmail, SendError, SendReceipt};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryDecision, RetryPolicy};
pub use sendgrid::SendGridMailer;
pub use smtp::SmtpMailer;
pub use worker::{DeliveryContext, WorkerPool, WorkerPoolError};
