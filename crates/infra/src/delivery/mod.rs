//! One delivery attempt: render the body, POST it, record the outcome.

pub mod client;
pub mod processor;
pub mod template;

pub use client::{DeliveryClient, DeliveryError, ReqwestDeliveryClient};
pub use processor::{ProcessError, ProcessOutcome, Processor};
pub use template::{
    HandlebarsRenderer, InMemoryTemplateRepository, PostgresTemplateRepository, TemplateConfig,
    TemplateError, TemplateRenderer, TemplateRepository,
};
