use clap::{ArgAction, Args, Parser, Subcommand, builder::BoolishValueParser};

#[derive(Parser, Debug)]
#[command(
    name = "rtc-probe",
    about = "Peer-to-peer WebRTC latency and bandwidth probe",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[command(flatten)]
    pub workload: WorkloadArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    #[arg(
        long = "signal-url",
        global = true,
        env = "RTC_PROBE_SIGNAL_URL",
        default_value = crate::config::DEFAULT_SIGNAL_URL,
        help = "WebSocket URL of the signal relay"
    )]
    pub signal_url: String,

    #[arg(
        long = "retry-offer",
        global = true,
        env = "RTC_PROBE_RETRY_OFFER",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Resend the local offer after ignoring a colliding remote offer"
    )]
    pub retry_offer: bool,

    #[arg(
        long = "ice-server",
        global = true,
        env = "RTC_PROBE_ICE_SERVERS",
        value_delimiter = ',',
        value_name = "URL",
        help = "STUN server URL (repeatable); host candidates only when omitted"
    )]
    pub ice_servers: Vec<String>,

    #[arg(
        long = "max-message-size",
        global = true,
        env = "RTC_PROBE_MAX_MESSAGE_SIZE",
        default_value_t = 65536,
        value_name = "BYTES",
        help = "Largest message the data channels accept"
    )]
    pub max_message_size: usize,

    #[arg(
        long,
        global = true,
        env = "RTC_PROBE_LABEL",
        value_name = "LABEL",
        help = "Name of this party in logs (defaults to a random id)"
    )]
    pub label: Option<String>,

    #[arg(
        long = "connect-timeout-secs",
        global = true,
        env = "RTC_PROBE_CONNECT_TIMEOUT_SECS",
        default_value_t = 30,
        value_name = "SECS",
        help = "How long to wait for the data channels to open"
    )]
    pub connect_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct WorkloadArgs {
    #[arg(
        long = "interval-ms",
        global = true,
        env = "RTC_PROBE_INTERVAL_MS",
        default_value_t = 1000,
        value_name = "MS",
        help = "Ping timeout and pause between pings"
    )]
    pub interval_ms: u64,

    #[arg(
        long,
        global = true,
        env = "RTC_PROBE_COUNT",
        value_name = "N",
        help = "Stop pinging after N attempts"
    )]
    pub count: Option<u64>,

    #[arg(
        long,
        global = true,
        env = "RTC_PROBE_MIB",
        default_value_t = 32,
        value_name = "MIB",
        help = "Bulk transfer size in MiB"
    )]
    pub mib: u64,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Answer pings and drain transfers until Ctrl-C
    Listen,
    /// Measure round-trip latency until Ctrl-C or --count
    Ping,
    /// Push --mib MiB over the reliable channel
    Bandwidth,
    /// Ping while the bulk transfer runs
    All,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::try_parse_from(["rtc-probe", "ping"]).unwrap();
        assert_eq!(cli.command, Command::Ping);
        assert_eq!(cli.connect.signal_url, crate::config::DEFAULT_SIGNAL_URL);
        assert!(cli.connect.retry_offer);
        assert!(cli.connect.ice_servers.is_empty());
        assert_eq!(cli.workload.interval_ms, 1000);
        assert_eq!(cli.workload.mib, 32);
        assert_eq!(cli.workload.count, None);
    }

    #[test]
    fn flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rtc-probe",
            "all",
            "--retry-offer",
            "false",
            "--ice-server",
            "stun:stun.l.google.com:19302",
            "--count",
            "10",
            "--mib",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.command, Command::All);
        assert!(!cli.connect.retry_offer);
        assert_eq!(cli.connect.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(cli.workload.count, Some(10));
        assert_eq!(cli.workload.mib, 4);
    }
}
