//! Ready-made scenario specs for the classic social-science patterns.
//!
//! Researchers usually start from one of these and tweak it rather than
//! writing a [`ScenarioSpec`] from scratch. Six presets cover the strategic
//! interaction families the platform was built around: two-player dilemmas,
//! coordination, effort provision, information cascades, consensus
//! formation, and spatial cooperation.
//!
//! # Example
//!
//! ```rust
//! use agorasim::presets;
//!
//! let spec = presets::prisoners_dilemma();
//! assert_eq!(spec.grammar.output_field(), "action");
//! assert!(presets::all().iter().all(|s| s.validate().is_ok()));
//! ```

use crate::scenario::{ActionGrammar, MechanicConfig, ScenarioSpec, Visibility};

/// Two suspects, cooperate or defect, simultaneous reveal.
pub fn prisoners_dilemma() -> ScenarioSpec {
    ScenarioSpec::builder("prisoners_dilemma", "Prisoner's Dilemma")
        .description(
            "Two suspects are arrested and held separately. Each must decide \
             whether to betray the other or remain silent.\n\
             Payoffs: If both cooperate (remain silent), both get 1 year. \
             If one defects (betrays) and other cooperates, defector goes free, \
             cooperator gets 5 years. If both defect, both get 3 years.",
        )
        .grammar(ActionGrammar::discrete("action", &["cooperate", "defect"]))
        .visibility(Visibility::Simultaneous)
        .rule("Your payoff depends on both your choice and your partner's choice.")
        .max_rounds(10)
        .build()
        .expect("prisoners_dilemma preset is valid")
}

/// Everyone hunts stag together or settles for hare alone.
pub fn stag_hunt() -> ScenarioSpec {
    ScenarioSpec::builder("stag_hunt", "Stag Hunt")
        .description(
            "Hunters must all choose stag (high reward) or hare (safe but low reward). \
             Stag requires everyone to cooperate. If even one person chooses hare, \
             the stag escapes and stag hunters get nothing.",
        )
        .grammar(ActionGrammar::discrete("action", &["stag", "hare"]))
        .visibility(Visibility::Simultaneous)
        .rule("Stag pays 5 if ALL choose it, else 0. Hare always pays 1.")
        .max_rounds(10)
        .build()
        .expect("stag_hunt preset is valid")
}

/// Team production where the weakest link sets the payoff.
pub fn minimum_effort() -> ScenarioSpec {
    ScenarioSpec::builder("minimum_effort", "Minimum Effort Game")
        .description(
            "Team members choose effort levels from 1-7. Your payoff depends on \
             the MINIMUM effort chosen by anyone in the group, minus your effort cost. \
             Higher effort = higher potential reward but requires everyone to coordinate.",
        )
        .grammar(ActionGrammar::integer("effort", 1, 7))
        .visibility(Visibility::Simultaneous)
        .rule("Payoff = (minimum group effort * 2) - (your effort * 0.1)")
        .max_rounds(10)
        .build()
        .expect("minimum_effort preset is valid")
}

/// The urn experiment: private draws, public guesses, sequential order.
pub fn information_cascade() -> ScenarioSpec {
    ScenarioSpec::builder("information_cascade", "Information Cascade (Urn Experiment)")
        .description(
            "An urn contains either 70% red balls (majority-red) or 70% blue balls \
             (majority-blue). You will privately draw a ball, see its color, replace it. \
             Then you must guess the urn type. You also see all previous participants' \
             public guesses (but not their private draws).",
        )
        .grammar(ActionGrammar::discrete(
            "action",
            &["majority_red", "majority_blue"],
        ))
        // Cascades only form when guesses are observed in order.
        .visibility(Visibility::Sequential)
        .rule("You earn $1 if correct, $0 if wrong.")
        .max_rounds(1)
        .build()
        .expect("information_cascade preset is valid")
}

/// Local negotiation towards a shared number.
pub fn consensus_game() -> ScenarioSpec {
    ScenarioSpec::builder("consensus_game", "Consensus Game")
        .description(
            "Participants coordinate to select the same number from 0-100 through \
             local negotiation. You can see your neighbors' current values. \
             Success when all agents converge on the same value (within +/-2).",
        )
        .grammar(ActionGrammar::integer("value", 0, 100))
        .visibility(Visibility::Sequential)
        .rule("All agents earn $10 if consensus achieved, else $0.")
        .max_rounds(20)
        .build()
        .expect("consensus_game preset is valid")
}

/// Prisoner's dilemma against grid neighbours.
pub fn spatial_cooperation() -> ScenarioSpec {
    ScenarioSpec::builder("spatial_cooperation", "Spatial Cooperation Game")
        .description(
            "Agents arranged on a grid play Prisoner's Dilemma with immediate neighbors. \
             You can see your neighbors' last choices (cooperate/defect). \
             Cooperate: both get 1. Defect vs cooperate: defector gets 2, cooperator gets 0. \
             Both defect: both get 0.",
        )
        .grammar(ActionGrammar::discrete("action", &["cooperate", "defect"]))
        .visibility(Visibility::Simultaneous)
        .mechanic(MechanicConfig::Grid {
            width: 4,
            height: 4,
        })
        .rule("Your payoff is the sum of outcomes with all neighbors.")
        .max_rounds(15)
        .build()
        .expect("spatial_cooperation preset is valid")
}

/// Every preset, in presentation order.
pub fn all() -> Vec<ScenarioSpec> {
    vec![
        prisoners_dilemma(),
        stag_hunt(),
        minimum_effort(),
        information_cascade(),
        consensus_game(),
        spatial_cooperation(),
    ]
}
