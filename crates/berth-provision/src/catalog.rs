//! Plan catalog: the immutable menu of purchasable server plans.
//!
//! Plans are seeded at startup (builtin defaults, optionally replaced by a
//! JSON document from operator configuration) and read-only afterwards.
//! Everything the provisioner needs to create a server comes from here:
//! resource limits, the panel egg/template, the docker image, the startup
//! command, and the environment variable map.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use berth_core::PlanId;

use crate::error::{Error, Result};

/// The game a plan hosts.
///
/// The family decides the port band servers of this plan bind to, so two
/// games never compete for the same slice of a node's allocation pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameFamily {
    /// Minecraft: Java Edition.
    MinecraftJava,
    /// Minecraft: Bedrock Edition.
    MinecraftBedrock,
    /// Valheim dedicated server.
    Valheim,
    /// Terraria (tShock) dedicated server.
    Terraria,
}

impl GameFamily {
    /// All known families, in port-band order.
    pub const ALL: [Self; 4] = [
        Self::MinecraftJava,
        Self::MinecraftBedrock,
        Self::Valheim,
        Self::Terraria,
    ];
}

impl std::fmt::Display for GameFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MinecraftJava => write!(f, "minecraft_java"),
            Self::MinecraftBedrock => write!(f, "minecraft_bedrock"),
            Self::Valheim => write!(f, "valheim"),
            Self::Terraria => write!(f, "terraria"),
        }
    }
}

/// One purchasable plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Plan {
    /// Stable catalog slug, e.g. `mc-java-4gb`.
    pub id: PlanId,
    /// Which game this plan hosts.
    pub game: GameFamily,
    /// Customer-facing name.
    pub display_name: String,
    /// Memory footprint in MB. This is the number placement packs against.
    pub memory_mb: u32,
    /// CPU share in percent of one core (100 = one full core).
    pub cpu_percent: u32,
    /// Disk quota in MB.
    pub disk_mb: u32,
    /// Swap allowance in MB.
    pub swap_mb: u32,
    /// Block IO weight (panel convention, 10..=1000).
    pub io_weight: u32,
    /// Monthly price in cents.
    pub monthly_price_cents: u32,
    /// The billing provider's price object this plan maps to.
    pub billing_price_ref: String,
    /// Panel egg/template id used at server creation.
    pub egg_id: u32,
    /// Docker image the server runs in.
    pub docker_image: String,
    /// Startup command template.
    pub startup_command: String,
    /// Environment variables passed to the panel at creation.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Inactive plans stay visible on existing orders but reject new ones.
    #[serde(default = "default_active")]
    pub active: bool,
}

const fn default_active() -> bool {
    true
}

/// The seeded, read-only plan catalog.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<PlanId, Plan>,
}

impl PlanCatalog {
    /// Builds a catalog from a list of plans.
    ///
    /// # Errors
    ///
    /// Returns an error if two plans share an id.
    pub fn from_plans(plans: Vec<Plan>) -> Result<Self> {
        let mut map = HashMap::with_capacity(plans.len());
        for plan in plans {
            let id = plan.id.clone();
            if map.insert(id.clone(), plan).is_some() {
                return Err(Error::configuration(format!(
                    "duplicate plan id in catalog: {id}"
                )));
            }
        }
        Ok(Self { plans: map })
    }

    /// Parses a catalog from a JSON array of plans.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON or duplicate plan ids.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let plans: Vec<Plan> = serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization(format!("plan catalog: {e}")))?;
        Self::from_plans(plans)
    }

    /// The builtin seed catalog used when no operator catalog is supplied.
    #[must_use]
    pub fn builtin() -> Self {
        let plans = vec![
            seed_plan(
                "mc-java-2gb",
                GameFamily::MinecraftJava,
                "Minecraft Java 2GB",
                2048,
                799,
                "price_mc_java_2gb",
            ),
            seed_plan(
                "mc-java-4gb",
                GameFamily::MinecraftJava,
                "Minecraft Java 4GB",
                4096,
                1399,
                "price_mc_java_4gb",
            ),
            seed_plan(
                "mc-java-8gb",
                GameFamily::MinecraftJava,
                "Minecraft Java 8GB",
                8192,
                2499,
                "price_mc_java_8gb",
            ),
            seed_plan(
                "mc-bedrock-2gb",
                GameFamily::MinecraftBedrock,
                "Minecraft Bedrock 2GB",
                2048,
                699,
                "price_mc_bedrock_2gb",
            ),
            seed_plan(
                "valheim-4gb",
                GameFamily::Valheim,
                "Valheim 4GB",
                4096,
                1499,
                "price_valheim_4gb",
            ),
            seed_plan(
                "terraria-1gb",
                GameFamily::Terraria,
                "Terraria 1GB",
                1024,
                499,
                "price_terraria_1gb",
            ),
        ];

        // Builtin seed has distinct ids by construction.
        Self::from_plans(plans).unwrap_or_else(|_| Self {
            plans: HashMap::new(),
        })
    }

    /// Looks up a plan by id.
    #[must_use]
    pub fn get(&self, id: &PlanId) -> Option<&Plan> {
        self.plans.get(id)
    }

    /// Looks up a plan that must exist and be active (purchasable).
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlanNotFound`] for unknown or inactive plans. The
    /// two cases are deliberately indistinguishable to callers: both need
    /// an operator fix, not a retry.
    pub fn get_active(&self, id: &PlanId) -> Result<&Plan> {
        self.plans
            .get(id)
            .filter(|plan| plan.active)
            .ok_or_else(|| Error::PlanNotFound {
                plan_id: id.clone(),
            })
    }

    /// Number of plans in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// Returns true if the catalog holds no plans.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Iterates over all plans in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }
}

fn seed_plan(
    id: &str,
    game: GameFamily,
    display_name: &str,
    memory_mb: u32,
    monthly_price_cents: u32,
    billing_price_ref: &str,
) -> Plan {
    let (egg_id, docker_image, startup_command, environment) = seed_runtime(game);
    Plan {
        id: PlanId::new(id),
        game,
        display_name: display_name.to_string(),
        memory_mb,
        cpu_percent: 200,
        disk_mb: memory_mb.saturating_mul(5),
        swap_mb: 0,
        io_weight: 500,
        monthly_price_cents,
        billing_price_ref: billing_price_ref.to_string(),
        egg_id,
        docker_image: docker_image.to_string(),
        startup_command: startup_command.to_string(),
        environment,
        active: true,
    }
}

fn seed_runtime(
    game: GameFamily,
) -> (u32, &'static str, &'static str, BTreeMap<String, String>) {
    let env = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<String, String>>()
    };

    match game {
        GameFamily::MinecraftJava => (
            1,
            "ghcr.io/pterodactyl/yolks:java_21",
            "java -Xms128M -Xmx{{SERVER_MEMORY}}M -jar {{SERVER_JARFILE}}",
            env(&[("SERVER_JARFILE", "server.jar"), ("VANILLA_VERSION", "latest")]),
        ),
        GameFamily::MinecraftBedrock => (
            2,
            "ghcr.io/pterodactyl/yolks:debian",
            "./bedrock_server",
            env(&[("BEDROCK_VERSION", "latest")]),
        ),
        GameFamily::Valheim => (
            3,
            "ghcr.io/pterodactyl/games:source",
            "./valheim_server.x86_64 -name \"{{SERVER_NAME}}\" -port {{SERVER_PORT}}",
            env(&[("SRCDS_APPID", "896660")]),
        ),
        GameFamily::Terraria => (
            4,
            "ghcr.io/pterodactyl/yolks:dotnet_6",
            "./TShock.Server -port {{SERVER_PORT}} -maxplayers {{MAX_PLAYERS}}",
            env(&[("MAX_PLAYERS", "8")]),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_nonempty() {
        let catalog = PlanCatalog::builtin();
        assert!(!catalog.is_empty());
        assert!(catalog.get(&PlanId::new("mc-java-4gb")).is_some());
    }

    #[test]
    fn duplicate_plan_ids_rejected() {
        let a = seed_plan(
            "dup",
            GameFamily::Valheim,
            "A",
            1024,
            100,
            "price_a",
        );
        let b = seed_plan(
            "dup",
            GameFamily::Terraria,
            "B",
            2048,
            200,
            "price_b",
        );
        assert!(PlanCatalog::from_plans(vec![a, b]).is_err());
    }

    #[test]
    fn inactive_plan_is_not_purchasable() -> Result<()> {
        let mut plan = seed_plan(
            "retired",
            GameFamily::MinecraftJava,
            "Retired",
            1024,
            100,
            "price_retired",
        );
        plan.active = false;
        let catalog = PlanCatalog::from_plans(vec![plan])?;

        assert!(catalog.get(&PlanId::new("retired")).is_some());
        assert!(catalog.get_active(&PlanId::new("retired")).is_err());
        Ok(())
    }

    #[test]
    fn catalog_parses_from_json() -> Result<()> {
        let json = serde_json::json!([{
            "id": "custom-3gb",
            "game": "minecraft_java",
            "display_name": "Custom 3GB",
            "memory_mb": 3072,
            "cpu_percent": 150,
            "disk_mb": 10240,
            "swap_mb": 0,
            "io_weight": 500,
            "monthly_price_cents": 999,
            "billing_price_ref": "price_custom_3gb",
            "egg_id": 1,
            "docker_image": "ghcr.io/pterodactyl/yolks:java_21",
            "startup_command": "java -jar server.jar"
        }]);
        let catalog = PlanCatalog::from_json_slice(json.to_string().as_bytes())?;
        let plan = catalog.get_active(&PlanId::new("custom-3gb"))?;
        assert_eq!(plan.memory_mb, 3072);
        assert!(plan.active, "active defaults to true");
        Ok(())
    }
}
