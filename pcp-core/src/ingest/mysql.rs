//! Live feed from the line controller's MySQL/MariaDB database.

use super::legacy::{machine_number_text, parse_timestamp, LegacyBatch, LegacyPulseFeed};
use crate::error::{Error, Result};
use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder};
use std::time::Duration;

/// Both columns are read as text so any column type the controller used
/// lands in the same parser.
const PULSES_AFTER: &str = "SELECT CAST(id AS SIGNED), CAST(num_maq AS CHAR), \
     CAST(`timestamp` AS CHAR) FROM prensavulc WHERE id > ? ORDER BY id ASC";

/// Feed over the controller table `prensavulc`.
///
/// Each poll opens its own connection, so a restarted database server is
/// picked up on the next poll.
pub struct MySqlLegacyFeed {
    opts: Opts,
}

impl MySqlLegacyFeed {
    /// Parse `url` without connecting
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let opts = Opts::from_url(&driver_url(url))
            .map_err(|e| Error::Config(format!("invalid sync.legacy_url: {}", e)))?;
        let opts = OptsBuilder::from_opts(opts)
            .tcp_connect_timeout(Some(timeout))
            .read_timeout(Some(timeout));
        Ok(Self { opts: opts.into() })
    }
}

impl LegacyPulseFeed for MySqlLegacyFeed {
    fn pulses_after(&self, last_id: i64) -> Result<LegacyBatch> {
        let mut conn = Conn::new(self.opts.clone()).map_err(feed_error)?;
        let rows: Vec<(i64, Option<String>, Option<String>)> = conn
            .exec(PULSES_AFTER, (last_id,))
            .map_err(feed_error)?;

        let mut batch = LegacyBatch::default();
        for (id, machine, timestamp) in rows {
            batch.push(
                id,
                machine.as_deref().and_then(machine_number_text),
                timestamp.as_deref().and_then(parse_timestamp),
            );
        }
        Ok(batch)
    }
}

/// The driver only knows the `mysql://` scheme.
fn driver_url(url: &str) -> String {
    match url.strip_prefix("mariadb://") {
        Some(rest) => format!("mysql://{}", rest),
        None => url.to_string(),
    }
}

fn feed_error(err: mysql::Error) -> Error {
    match err {
        mysql::Error::IoError(_) | mysql::Error::DriverError(_) => {
            Error::StoreUnavailable(format!("legacy database: {}", err))
        }
        other => Error::Store(format!("legacy database: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mariadb_scheme_is_accepted() {
        assert_eq!(
            driver_url("mariadb://pcp:pw@10.0.0.5:3306/plant"),
            "mysql://pcp:pw@10.0.0.5:3306/plant"
        );
        assert_eq!(driver_url("mysql://10.0.0.5/plant"), "mysql://10.0.0.5/plant");
        let feed = MySqlLegacyFeed::new(
            "mariadb://pcp:pw@10.0.0.5:3306/plant",
            Duration::from_secs(5),
        );
        assert!(feed.is_ok());
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = MySqlLegacyFeed::new("mysql://[::1/plant", Duration::from_secs(5));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unreachable_server_is_transient() {
        // Port 9 (discard) refuses connections on loopback
        let feed =
            MySqlLegacyFeed::new("mysql://pcp@127.0.0.1:9/plant", Duration::from_secs(2)).unwrap();
        let err = feed.pulses_after(0).unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
