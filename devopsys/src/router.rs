//! Keyword router.
//!
//! Scores the raw request against per-capability keyword patterns. The
//! winner is handed to the planner as a hint; it never stands in for a plan.

use std::sync::OnceLock;

use regex::Regex;

use crate::agents::Capability;

/// Routing decision for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub capability: Capability,
    pub score: u32,
    pub reason: String,
}

const KEYWORDS: &[(Capability, &[&str])] = &[
    (
        Capability::Docker,
        &[r"\bdockerfile\b", r"\bdocker\b", r"container\b"],
    ),
    (
        Capability::Python,
        &[
            r"\bpython\b",
            r"\.py\b",
            r"fastapi|uvicorn|poetry|pip|pyproject",
            r"draw|circle|plot|graph|visualise|visualize",
            r"рису(й|ет|ем)|круг|график|построй",
        ],
    ),
    (
        Capability::Rust,
        &[r"\brust\b", r"cargo\b", r"\.rs\b"],
    ),
    (
        Capability::Bash,
        &[
            r"\bbash\b",
            r"shell\b",
            r"\.sh\b",
            r"cron|rsync|grep|sed|awk",
            r"launch|start|bootstrap",
            r"запуск|запусти|старт",
        ],
    ),
    (
        Capability::Linux,
        &[
            r"\bubuntu\b",
            r"\barch\b",
            r"linux\b",
            r"apt\b|pacman\b|systemd\b",
        ],
    ),
    (
        Capability::ProjectArchitect,
        &[
            r"\bproject\b",
            r"\bscaffold\b",
            r"\bstructure\b",
            r"pyproject\.toml",
            r"readme\.md",
            r"\bmodule\b",
            r"\bsrc\b",
            r"проект",
            r"структур",
            r"каталог",
        ],
    ),
];

fn compiled() -> &'static [(Capability, Vec<Regex>)] {
    static PATTERNS: OnceLock<Vec<(Capability, Vec<Regex>)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        KEYWORDS
            .iter()
            .map(|(cap, pats)| {
                let res = pats.iter().filter_map(|p| Regex::new(p).ok()).collect();
                (*cap, res)
            })
            .collect()
    })
}

/// Pick the best-matching capability; ties keep the earlier entry.
pub fn classify(text: &str) -> Route {
    let lowered = text.to_lowercase();
    let mut best: Option<Route> = None;

    for (cap, patterns) in compiled() {
        let hits = patterns.iter().filter(|re| re.is_match(&lowered)).count() as u32;
        if hits == 0 {
            continue;
        }
        let bonus = if *cap == Capability::Docker && lowered.contains("dockerfile") {
            5
        } else {
            0
        };
        let score = hits + bonus;
        if best.as_ref().is_none_or(|b| score > b.score) {
            best = Some(Route {
                capability: *cap,
                score,
                reason: format!("matched {hits} keywords for {cap}"),
            });
        }
    }

    best.unwrap_or(Route {
        capability: Capability::Python,
        score: 0,
        reason: "fallback to python".to_string(),
    })
}
