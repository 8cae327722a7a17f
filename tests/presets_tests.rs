use agorasim::presets;
use agorasim::scenario::{ActionGrammar, MechanicConfig, Visibility};

#[test]
fn test_every_preset_validates() {
    let specs = presets::all();
    assert_eq!(specs.len(), 6);
    for spec in &specs {
        assert!(spec.validate().is_ok(), "preset '{}' must validate", spec.id);
        assert!(!spec.description.is_empty());
    }
}

#[test]
fn test_preset_ids_are_unique() {
    let specs = presets::all();
    let mut ids: Vec<&str> = specs.iter().map(|s| s.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), specs.len());
}

#[test]
fn test_prisoners_dilemma_shape() {
    let spec = presets::prisoners_dilemma();
    match &spec.grammar {
        ActionGrammar::Discrete {
            output_field,
            actions,
        } => {
            assert_eq!(output_field, "action");
            assert_eq!(actions, &vec!["cooperate".to_string(), "defect".to_string()]);
        }
        other => panic!("unexpected grammar: {:?}", other),
    }
    assert_eq!(spec.visibility, Visibility::Simultaneous);
}

#[test]
fn test_minimum_effort_uses_effort_range() {
    let spec = presets::minimum_effort();
    match &spec.grammar {
        ActionGrammar::Integer {
            output_field,
            min,
            max,
        } => {
            assert_eq!(output_field, "effort");
            assert_eq!((*min, *max), (1, 7));
        }
        other => panic!("unexpected grammar: {:?}", other),
    }
}

#[test]
fn test_consensus_game_uses_value_range() {
    let spec = presets::consensus_game();
    match &spec.grammar {
        ActionGrammar::Integer {
            output_field,
            min,
            max,
        } => {
            assert_eq!(output_field, "value");
            assert_eq!((*min, *max), (0, 100));
        }
        other => panic!("unexpected grammar: {:?}", other),
    }
}

#[test]
fn test_information_cascade_is_sequential() {
    // Cascades need each participant to observe earlier public guesses.
    assert_eq!(
        presets::information_cascade().visibility,
        Visibility::Sequential
    );
}

#[test]
fn test_spatial_cooperation_carries_a_grid() {
    let spec = presets::spatial_cooperation();
    assert!(spec
        .mechanics
        .iter()
        .any(|m| matches!(m, MechanicConfig::Grid { .. })));
}
