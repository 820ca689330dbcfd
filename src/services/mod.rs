pub mod broker;
pub mod ingress;
pub mod metadata;
pub mod processor;
pub mod storage;
pub mod worker;
