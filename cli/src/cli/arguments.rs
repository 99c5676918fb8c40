use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use portrelay::config::{Config, ConfigStore, RouteStore};
use portrelay::control::{ControlClient, ControlResponse};
use portrelay::ipc;
use portrelay::route::{Endpoint, Protocol, Route, RouteDefinition, RouteStatus, RouteTable};

/// Route fields shared by `add` and `update`
#[derive(Debug, Clone, Args)]
pub struct RouteArgs {
    #[arg(short = 'p', long = "protocol", help = "Transport to forward: tcp or udp")]
    pub protocol: Protocol,

    #[arg(short = 'l', long = "listen", help = "Endpoint to listen on, host:port or a bare port (binds 0.0.0.0)")]
    pub listen: Endpoint,

    #[arg(short = 'f', long = "forward", help = "Endpoint to forward to, host:port")]
    pub forward: Endpoint,

    #[arg(short = 'd', long = "disabled", help = "Save the route without starting it")]
    pub disabled: bool,
}

impl RouteArgs {
    pub fn to_definition(&self, name: &str) -> RouteDefinition {
        RouteDefinition {
            name: Some(name.to_string()),
            protocol: Some(self.protocol),
            listen: Some(self.listen.clone()),
            forward: Some(self.forward.clone()),
            enabled: Some(!self.disabled),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "portrelay", about, author, version, long_about = None, propagate_version = true)]
pub struct PortrelayArguments {
    #[arg(short = 'c', long = "config", help = "Path to the configuration file (overrides running instance)")]
    pub(crate) config_path: Option<String>,
    #[arg(short = 'v', long = "verbose", help = "Enable verbose logging")]
    pub(crate) verbose: bool,
    #[arg(short = 'w', long = "watch", help = "Watch the configuration file for route changes")]
    pub(crate) watch_config: bool,
    #[command(subcommand)]
    pub(crate) command: Option<PortrelayCommands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum PortrelayCommands {
    #[clap(name = "routes", about = "Manage forwarding routes")]
    Routes {
        #[clap(subcommand)]
        command: RouteCommands,
    },
    #[clap(name = "restart", about = "Restart every listener of the running instance")]
    Restart,
    #[clap(name = "config", about = "Manage the configuration file")]
    Config {
        #[clap(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum RouteCommands {
    #[clap(name = "list", about = "List all routes")]
    ListRoutes,
    #[clap(name = "show", about = "Show a route")]
    ShowRoute { name: String },
    #[clap(name = "add", about = "Add a new route")]
    AddRoute {
        name: String,
        #[clap(flatten)]
        route: RouteArgs,
    },
    #[clap(name = "update", about = "Replace a route's protocol, endpoints and enabled flag")]
    UpdateRoute {
        name: String,
        #[clap(flatten)]
        route: RouteArgs,
    },
    #[clap(name = "remove", about = "Remove a route")]
    RemoveRoute { name: String },
    #[clap(name = "toggle", about = "Enable a disabled route or disable an enabled one")]
    ToggleRoute { name: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    #[clap(name = "show", about = "Show the current configuration")]
    Show,
    #[clap(name = "show-path", about = "Show the path to the configuration file")]
    ShowPath,
}

/// Where route commands are applied: the live daemon, or the config file when none is running.
enum Target {
    Remote(ControlClient),
    Offline { table: RouteTable, store: ConfigStore },
}

impl PortrelayArguments {
    pub async fn handle_arguments(&self) -> Result<()> {
        if let Some(command) = &self.command {
            let effective_config_path = Config::resolve_config_path(self.config_path.clone()).await;
            let config = Config::try_load(&effective_config_path).await?;
            match command {
                // ---
                // Routes subcommand
                // ---
                PortrelayCommands::Routes { command } => {
                    let mut target = self.target(config).await;
                    target.run(command).await?;
                }
                PortrelayCommands::Restart => match self.target(config).await {
                    Target::Remote(client) => report(client.restart().await?)?,
                    Target::Offline { .. } => bail!("No running instance to restart"),
                },

                // ---
                // Config subcommand
                // ---
                PortrelayCommands::Config { command } => match command {
                    ConfigCommands::Show => {
                        println!("{}", config);
                    }
                    ConfigCommands::ShowPath => {
                        println!("{}", config.get_path().to_string_lossy())
                    }
                },
            }
            // Exit after the command has been executed
            std::process::exit(0);
        }
        Ok(())
    }

    async fn target(&self, config: Config) -> Target {
        if let Some(instance) = ipc::get_running_instance().await {
            let same_file = self.config_path.as_deref().is_none_or(|path| path == instance.config_path);
            if same_file {
                info!("Using running instance at {}", instance.control_addr);
                return Target::Remote(ControlClient::new(instance.control_addr));
            }
        }
        let table = RouteTable::from_routes(config.get_routes().to_vec());
        Target::Offline { table, store: ConfigStore::new(config) }
    }
}

impl Target {
    async fn run(&mut self, command: &RouteCommands) -> Result<()> {
        match self {
            Target::Remote(client) => match command {
                RouteCommands::ListRoutes => {
                    for status in client.list_routes().await? {
                        print_status(&status);
                    }
                }
                RouteCommands::ShowRoute { name } => match client.get_route(name).await? {
                    Some(status) => print_status(&status),
                    None => error!("Route not found: {}", name),
                },
                RouteCommands::AddRoute { name, route } => report(client.add_route(&route.to_definition(name)).await?)?,
                RouteCommands::UpdateRoute { name, route } => report(client.update_route(name, &route.to_definition(name)).await?)?,
                RouteCommands::RemoveRoute { name } => report(client.remove_route(name).await?)?,
                RouteCommands::ToggleRoute { name } => report(client.toggle_route(name).await?)?,
            },
            Target::Offline { table, store } => {
                let changed = apply_offline(table, command)?;
                if changed {
                    store.save(table.list())?;
                    info!("Saved routes to {}", store.path().display());
                }
            }
        }
        Ok(())
    }
}

/// Apply a route command to a route table loaded from disk. Returns whether the table changed.
pub fn apply_offline(table: &mut RouteTable, command: &RouteCommands) -> Result<bool> {
    match command {
        RouteCommands::ListRoutes => {
            for route in table.list() {
                println!("{}", format_route(route, None));
            }
            Ok(false)
        }
        RouteCommands::ShowRoute { name } => {
            match table.get(name) {
                Some(route) => println!("{}", format_route(route, None)),
                None => error!("Route not found: {}", name),
            }
            Ok(false)
        }
        RouteCommands::AddRoute { name, route } => {
            table.add(Route::from_definition(route.to_definition(name), None)?)?;
            info!("Added route: {}", name);
            Ok(true)
        }
        RouteCommands::UpdateRoute { name, route } => {
            let replacement = Route::from_definition(route.to_definition(name), Some(name))?;
            table.update(name, replacement)?;
            info!("Updated route: {}", name);
            Ok(true)
        }
        RouteCommands::RemoveRoute { name } => {
            table.remove(name)?;
            info!("Removed route: {}", name);
            Ok(true)
        }
        RouteCommands::ToggleRoute { name } => {
            let enabled = table.get(name).map(|r| !r.is_enabled()).unwrap_or(true);
            let route = table.set_enabled(name, enabled)?;
            info!("Route '{}' {}", route.get_name(), if enabled { "enabled" } else { "disabled" });
            Ok(true)
        }
    }
}

fn report(response: ControlResponse) -> Result<()> {
    if response.success {
        info!("{}", response.message);
        Ok(())
    } else {
        bail!("{}", response.message)
    }
}

fn print_status(status: &RouteStatus) {
    match Route::try_from(status.route.clone()) {
        Ok(route) => println!("{}", format_route(&route, Some(status.active))),
        Err(e) => warn!("Skipping unreadable route: {}", e),
    }
}

fn format_route(route: &Route, active: Option<bool>) -> String {
    let state = match (route.is_enabled(), active) {
        (_, Some(true)) => "\x1b[1;32mrunning\x1b[0m",
        (true, Some(false)) => "\x1b[1;31mnot running\x1b[0m",
        (true, None) => "enabled",
        (false, _) => "\x1b[2mdisabled\x1b[0m",
    };
    format!(
        "\x1b[1;36m{}\x1b[0m [\x1b[1;35m{}\x1b[0m]: \x1b[1;33m{}\x1b[0m -> \x1b[1;32m{}\x1b[0m ({})",
        route.get_name(),
        route.get_protocol(),
        route.get_listen(),
        route.get_forward(),
        state
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(protocol: Protocol, listen: &str, forward: &str, disabled: bool) -> RouteArgs {
        RouteArgs { protocol, listen: listen.parse().unwrap(), forward: forward.parse().unwrap(), disabled }
    }

    #[test]
    fn test_route_args_to_definition() {
        let definition = args(Protocol::Udp, "5353", "1.1.1.1:53", false).to_definition("dns");
        let route = Route::try_from(definition).unwrap();
        assert_eq!(route.get_name(), "dns");
        assert_eq!(route.get_protocol(), Protocol::Udp);
        assert_eq!(route.get_listen(), &Endpoint::new("0.0.0.0", 5353));
        assert_eq!(route.get_forward(), &Endpoint::new("1.1.1.1", 53));
        assert!(route.is_enabled());
    }

    #[test]
    fn test_route_args_disabled() {
        let definition = args(Protocol::Tcp, "[::1]:8080", "backend:3000", true).to_definition("web");
        assert_eq!(definition.enabled, Some(false));
        assert_eq!(definition.listen, Some(Endpoint::new("::1", 8080)));
    }

    #[test]
    fn test_parse_add_command() {
        let parsed = PortrelayArguments::try_parse_from(["portrelay", "routes", "add", "web", "-p", "tcp", "-l", "8080", "-f", "127.0.0.1:3000"]).unwrap();
        match parsed.command {
            Some(PortrelayCommands::Routes { command: RouteCommands::AddRoute { name, route } }) => {
                assert_eq!(name, "web");
                assert_eq!(route.protocol, Protocol::Tcp);
                assert_eq!(route.listen.port, 8080);
                assert!(!route.disabled);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(PortrelayArguments::try_parse_from(["portrelay", "routes", "add", "web", "-p", "sctp", "-l", "1", "-f", "a:2"]).is_err());
    }

    #[test]
    fn test_offline_commands_edit_table() {
        let mut table = RouteTable::new();
        let add = RouteCommands::AddRoute { name: "web".to_string(), route: args(Protocol::Tcp, "8080", "127.0.0.1:3000", false) };
        assert!(apply_offline(&mut table, &add).unwrap());
        assert!(apply_offline(&mut table, &add).is_err());

        let update = RouteCommands::UpdateRoute { name: "web".to_string(), route: args(Protocol::Udp, "9090", "127.0.0.1:4000", true) };
        assert!(apply_offline(&mut table, &update).unwrap());
        let route = table.get("web").unwrap();
        assert_eq!(route.get_protocol(), Protocol::Udp);
        assert!(!route.is_enabled());

        assert!(apply_offline(&mut table, &RouteCommands::ToggleRoute { name: "web".to_string() }).unwrap());
        assert!(table.get("web").unwrap().is_enabled());

        assert!(!apply_offline(&mut table, &RouteCommands::ListRoutes).unwrap());
        assert!(apply_offline(&mut table, &RouteCommands::RemoveRoute { name: "web".to_string() }).unwrap());
        assert!(apply_offline(&mut table, &RouteCommands::RemoveRoute { name: "web".to_string() }).is_err());
    }
}
