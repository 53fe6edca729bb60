use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "portmapd", version, about = "Port-map manager for lab NAT gateways")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Map a random public port to a machine inside the lab
    Create(CreateArgs),
    /// Tear down the mapping behind a connection port
    Destroy(DestroyArgs),
    /// Display the rules configured in a firewall table
    Show(ShowArgs),
    /// List port-mapping records
    Ls(LsArgs),
    /// List known machines and their addresses
    Addrs(AddrsArgs),
    /// Persist the live firewall rules across reboots
    Save,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// IPv4 address of the machine to expose
    #[arg(long)]
    pub target_addr: String,

    /// Port on the target machine
    #[arg(long)]
    pub target_port: u16,

    /// Human name of the machine
    #[arg(long)]
    pub target_name: String,

    /// Kind of machine (i.e. OneFS, InsightIQ, etc.)
    #[arg(long)]
    pub target_component: String,
}

#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// The public connection port to unmap
    pub conn_port: u16,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Which table to list: nat or filter
    #[arg(long, default_value = "filter")]
    pub table: String,

    /// Print the unparsed iptables listing
    #[arg(long)]
    pub raw: bool,
}

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Filter by machine name
    #[arg(long)]
    pub name: Option<String>,

    /// Filter by target IPv4 address
    #[arg(long)]
    pub addr: Option<String>,

    /// Filter by machine kind
    #[arg(long)]
    pub component: Option<String>,

    /// Filter by public connection port
    #[arg(long)]
    pub conn_port: Option<u16>,

    /// Filter by target port
    #[arg(long)]
    pub target_port: Option<u16>,

    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AddrsArgs {
    /// Look up the addresses of a machine by name
    #[arg(long, group = "selector")]
    pub name: Option<String>,

    /// Look up which machine owns an address
    #[arg(long, group = "selector")]
    pub addr: Option<String>,

    /// Look up all machines of one kind
    #[arg(long, group = "selector")]
    pub component: Option<String>,

    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
}
