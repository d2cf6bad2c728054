pub mod channels;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod messages;
pub mod notify;
pub mod poller;
pub mod queue;
pub mod report;
pub mod terminal;
pub mod transport;

#[cfg(test)]
pub mod test_support;
