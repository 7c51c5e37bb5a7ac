//! Shared state of one analysis run.
//!
//! A [`Context`] is built once per run and shared (`Arc`) by the packet
//! workers, the background flush tasks and the shutdown drain. It owns the
//! process-wide stores (credentials, services, extracted files) and the record
//! sink.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{DecodeError, Error, Result};
use crate::files::FileStore;
use crate::record::{Credentials, Record, RecordSink};
use crate::service::ServiceStore;
use crate::stats::Stats;
use crate::stream::conversation::ConversationInfo;

pub struct Context {
    pub config: Config,
    pub stats: Stats,
    pub credentials: CredentialStore,
    pub services: ServiceStore,
    pub files: FileStore,
    sink: Arc<dyn RecordSink>,
    /// First sink failure. Once set, the run must stop.
    fatal: Mutex<Option<String>>,
}

impl Context {
    pub fn new(config: Config, sink: Arc<dyn RecordSink>) -> Result<Self> {
        let credentials = CredentialStore::new(config.custom_regex.as_deref())
            .map_err(|e| Error::Config(format!("custom regex: {}", e)))?;
        let files = FileStore::new(&config);
        let services = ServiceStore::new(config.stop_after_service_probe_match);

        Ok(Self {
            config,
            stats: Stats::new(),
            credentials,
            services,
            files,
            sink,
            fatal: Mutex::new(None),
        })
    }

    /// Hand a record to the sink.
    ///
    /// A failed write is recorded as fatal and `false` is returned; callers
    /// stop producing records for the current unit of work.
    pub fn write(&self, record: Record) -> bool {
        if self.is_fatal() {
            return false;
        }
        match self.sink.write(&record) {
            Ok(()) => true,
            Err(e) => {
                error!(kind = record.as_str(), error = %e, "Failed to write record");
                let mut fatal = self.fatal.lock();
                if fatal.is_none() {
                    *fatal = Some(format!("{} record: {}", record.as_str(), e));
                }
                false
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// Error for the first sink failure, if any.
    pub fn check_fatal(&self) -> Result<()> {
        match self.fatal.lock().as_ref() {
            Some(reason) => Err(Error::Sink(reason.clone())),
            None => Ok(()),
        }
    }

    /// Run the credential harvesters over the start of a conversation and write new hits.
    pub fn harvest(&self, info: &ConversationInfo, data: &[u8]) {
        let limit = data.len().min(self.config.harvester_banner_size);
        let found = self.credentials.harvest(
            &data[..limit],
            &info.ident,
            info.timestamp,
            info.server_port,
            info.client_port,
            self.config.stop_after_harvester_match,
        );
        for credential in found {
            Stats::incr(&self.stats.credentials);
            self.write(Record::Credentials(credential));
        }
    }

    /// Store a credential found by a protocol reader. Written only when new.
    pub fn credential(&self, credential: Credentials) -> bool {
        if !self.credentials.insert(&credential) {
            return false;
        }
        Stats::incr(&self.stats.credentials);
        self.write(Record::Credentials(credential))
    }

    /// Log a protocol decoding error.
    pub fn parse_error(&self, ident: &str, protocol: &str, err: &DecodeError) {
        if err.is_eof() {
            return;
        }
        Stats::incr(&self.stats.parse_errors);
        if self.config.debug {
            warn!(ident = %ident, protocol, error = %err, "Failed to decode conversation");
        } else {
            debug!(ident = %ident, protocol, error = %err, "Failed to decode conversation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemorySink;
    use std::io;

    struct FailingSink;

    impl RecordSink for FailingSink {
        fn write(&self, _: &Record) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    // Test 1: Records reach the sink
    #[test]
    fn test_write() {
        let sink = Arc::new(MemorySink::new());
        let ctx = Context::new(Config::default(), sink.clone()).unwrap();
        assert!(ctx.write(Record::Credentials(Credentials::default())));
        assert_eq!(sink.count("credentials"), 1);
        assert!(ctx.check_fatal().is_ok());
    }

    // Test 2: Sink failure is fatal and sticky
    #[test]
    fn test_sink_failure_is_fatal() {
        let ctx = Context::new(Config::default(), Arc::new(FailingSink)).unwrap();
        assert!(!ctx.write(Record::Credentials(Credentials::default())));
        assert!(ctx.is_fatal());
        assert!(matches!(ctx.check_fatal(), Err(Error::Sink(_))));
    }

    // Test 3: Invalid custom regex is a configuration error
    #[test]
    fn test_invalid_custom_regex() {
        let config = Config {
            custom_regex: Some("(unclosed".into()),
            ..Default::default()
        };
        let err = Context::new(config, Arc::new(MemorySink::new())).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    // Test 4: Reader and harvester credentials share one dedup store
    #[test]
    fn test_credential_dedup() {
        let sink = Arc::new(MemorySink::new());
        let ctx = Context::new(Config::default(), sink.clone()).unwrap();
        let credential = Credentials {
            service: "FTP".into(),
            flow: "10.0.0.1:5000->10.0.0.2:21".into(),
            user: "ftpuser".into(),
            password: "ftppass".into(),
            ..Default::default()
        };
        assert!(ctx.credential(credential.clone()));
        assert!(!ctx.credential(credential));

        let info = ConversationInfo {
            ident: "10.0.0.3:6000->10.0.0.2:21".into(),
            timestamp: 9,
            client_ip: "10.0.0.3".parse().unwrap(),
            client_port: 6000,
            server_ip: "10.0.0.2".parse().unwrap(),
            server_port: 21,
            transport: "TCP",
        };
        ctx.harvest(&info, b"220 (vsFTPd 3.0.3)\r\nUSER ftpuser\r\n331 Please specify the password.\r\nPASS ftppass\r\n");

        assert_eq!(sink.count("credentials"), 1);
        assert_eq!(ctx.stats.snapshot().credentials, 1);
    }
}
