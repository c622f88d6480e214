// In-memory mesh simulation over the Local transport
//
// Builds N nodes on one LocalMedium, links them in the requested topology,
// sends one broadcast and one end-to-end unicast from the first node, and
// reports what every node received.

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::*;
use meshlink_core::transport::{LocalMedium, LocalTransport};
use meshlink_core::{
    MeshConfig, MeshKey, MeshNode, MeshTransport, MessageType, NodeEvent, PeerId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE_TIME: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Topology {
    /// 0 - 1 - 2 - ... - N-1
    Line,
    /// A line with the ends joined
    Ring,
    /// Every node linked to every other
    Full,
}

impl Topology {
    /// Undirected links between node indices
    pub fn links(self, nodes: usize) -> Vec<(usize, usize)> {
        match self {
            Topology::Line => (1..nodes).map(|i| (i - 1, i)).collect(),
            Topology::Ring => {
                let mut links: Vec<_> = (1..nodes).map(|i| (i - 1, i)).collect();
                if nodes > 2 {
                    links.push((nodes - 1, 0));
                }
                links
            }
            Topology::Full => (0..nodes)
                .flat_map(|a| (a + 1..nodes).map(move |b| (a, b)))
                .collect(),
        }
    }
}

pub struct SimulationOptions {
    pub nodes: usize,
    pub topology: Topology,
    pub ttl: u8,
    pub invite: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeTally {
    pub broadcasts: usize,
    pub unicasts: usize,
}

struct SimNode {
    node: MeshNode,
    events: mpsc::Receiver<NodeEvent>,
    // Keeps the radio registered on the medium
    _transport: Arc<LocalTransport>,
}

fn sim_id(index: usize) -> PeerId {
    let mut bytes = [0u8; 8];
    bytes[0] = 0x5e;
    bytes[4..].copy_from_slice(&(index as u32).to_be_bytes());
    PeerId::from_bytes(bytes)
}

pub async fn run(options: &SimulationOptions, mut config: MeshConfig) -> Result<Vec<NodeTally>> {
    if options.nodes < 2 {
        anyhow::bail!("A simulation needs at least 2 nodes");
    }

    config.routing.default_ttl = options.ttl;
    // Quiet links: no periodic announces during the run
    config.node.announce_interval_secs = 0;
    config.validate().context("Invalid configuration")?;

    let mesh_key = MeshKey::derive_with_iterations(&options.invite, config.security.kdf_iterations)
        .context("Failed to derive mesh key")?;

    let medium = LocalMedium::new();
    let mut sims = Vec::with_capacity(options.nodes);
    for index in 0..options.nodes {
        let transport = Arc::new(medium.transport(sim_id(index)));
        let (node, events) = MeshNode::new(
            config.clone(),
            sim_id(index),
            mesh_key.clone(),
            vec![transport.clone() as Arc<dyn MeshTransport>],
        )?;
        sims.push(SimNode {
            node,
            events,
            _transport: transport,
        });
    }

    let links = options.topology.links(options.nodes);
    info!(
        "Simulating {} nodes ({:?}, {} links) on mesh {}",
        options.nodes,
        options.topology,
        links.len(),
        mesh_key.fingerprint_hex()
    );
    for &(a, b) in &links {
        medium.link(sim_id(a), sim_id(b));
    }
    for sim in &sims {
        sim.node.start().await;
    }
    wait_for_discovery(&sims, &links).await?;

    let origin = &sims[0].node;
    let last = sim_id(options.nodes - 1);
    origin
        .send(None, MessageType::Data, b"hello mesh".to_vec(), false)
        .await
        .context("Broadcast failed")?;
    origin
        .send(Some(last), MessageType::Data, b"hello last".to_vec(), true)
        .await
        .context("Unicast failed")?;

    tokio::time::sleep(SETTLE_TIME).await;

    let mut tallies = Vec::with_capacity(sims.len());
    for sim in &mut sims {
        let mut tally = NodeTally::default();
        while let Ok(event) = sim.events.try_recv() {
            if let NodeEvent::Delivered(delivery) = event {
                match delivery.destination_id {
                    None => tally.broadcasts += 1,
                    Some(_) => tally.unicasts += 1,
                }
            }
        }
        tallies.push(tally);
    }

    for sim in &sims {
        sim.node.shutdown().await;
    }
    Ok(tallies)
}

async fn wait_for_discovery(sims: &[SimNode], links: &[(usize, usize)]) -> Result<()> {
    let expected: Vec<usize> = (0..sims.len())
        .map(|i| links.iter().filter(|(a, b)| *a == i || *b == i).count())
        .collect();

    tokio::time::timeout(DISCOVERY_TIMEOUT, async {
        loop {
            let done = sims
                .iter()
                .zip(&expected)
                .all(|(sim, want)| sim.node.peers().len() >= *want);
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("Nodes did not discover their neighbours in time")
}

pub fn print_report(options: &SimulationOptions, tallies: &[NodeTally]) {
    println!(
        "{} {} nodes, {:?} topology, ttl {}",
        "Simulation:".bold(),
        options.nodes,
        options.topology,
        options.ttl
    );
    println!();
    println!("  {:<20} {:>10} {:>10}", "node", "broadcast", "unicast");
    for (index, tally) in tallies.iter().enumerate() {
        let id = sim_id(index).to_string();
        let role = match index {
            0 => " (origin)",
            i if i == tallies.len() - 1 => " (target)",
            _ => "",
        };
        let broadcast = if index == 0 {
            "-".dimmed().to_string()
        } else if tally.broadcasts == 1 {
            tally.broadcasts.to_string().green().to_string()
        } else {
            tally.broadcasts.to_string().red().to_string()
        };
        println!(
            "  {:<20} {:>10} {:>10}{}",
            id.bright_cyan(),
            broadcast,
            tally.unicasts,
            role.dimmed()
        );
    }

    let reached = tallies.iter().skip(1).filter(|t| t.broadcasts > 0).count();
    println!();
    println!(
        "  Broadcast reached {}/{} nodes",
        reached,
        tallies.len() - 1
    );
    let target_got = tallies.last().map_or(0, |t| t.unicasts);
    if target_got == 1 {
        println!("  {} Unicast delivered exactly once", "✓".green());
    } else {
        println!("  {} Unicast delivered {} times", "✗".red(), target_got);
    }
}
