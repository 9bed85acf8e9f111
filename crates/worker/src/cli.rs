use std::net::Ipv4Addr;

use clap::Parser;

use swarmpi_proto::MASTER_RPC_PORT;

#[derive(Debug, Clone, Parser)]
#[command(name = "swarmpi-worker", version, about = "Computes BBP π term ranges for a master")]
pub struct Cli {
    /// Master IPv4 address.
    #[arg(short = 'i', long = "ip", env = "SWARMPI_MASTER_IP")]
    pub ip: Ipv4Addr,

    /// Master RPC port.
    #[arg(long, env = "SWARMPI_MASTER_PORT", default_value_t = MASTER_RPC_PORT)]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_is_required_and_parsed() {
        assert!(Cli::try_parse_from(["swarmpi-worker"]).is_err());
        assert!(Cli::try_parse_from(["swarmpi-worker", "--ip", "not-an-ip"]).is_err());

        let cli = Cli::try_parse_from(["swarmpi-worker", "-i", "192.168.0.7"]).unwrap();
        assert_eq!(cli.ip, Ipv4Addr::new(192, 168, 0, 7));
        assert_eq!(cli.port, 9999);

        let cli =
            Cli::try_parse_from(["swarmpi-worker", "--ip", "10.0.0.1", "--port", "4242"]).unwrap();
        assert_eq!(cli.port, 4242);
    }
}
