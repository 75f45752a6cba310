//! Property tests for execution context scoping

use indexmap::IndexMap;
use proptest::prelude::*;

use rollout::connection::CommandSpec;
use rollout::executor::{ExecutionContext, Overrides, Scoped};
use rollout::Error;

fn arb_overrides() -> impl Strategy<Value = Overrides> {
    (
        prop::collection::vec(("[A-Z]{1,3}", "[a-z0-9]{0,4}"), 0..3),
        prop::option::of(prop_oneof!["[a-z]{1,5}", "/[a-z]{1,5}", "~/[a-z]{1,5}"]),
        prop::option::of("[a-z]{1,6}"),
        prop::option::of(prop_oneof![Just("web"), Just("worker")]),
    )
        .prop_map(|(env, cwd, prefix, role)| {
            let mut overrides = Overrides::new();
            for (key, value) in env {
                overrides = overrides.env(key, value);
            }
            if let Some(cwd) = cwd {
                overrides = overrides.cwd(cwd);
            }
            if let Some(prefix) = prefix {
                overrides = overrides.prefix(CommandSpec::new("source").arg(prefix));
            }
            if let Some(role) = role {
                overrides = overrides.role(role);
            }
            overrides
        })
}

fn seeded() -> ExecutionContext {
    let mut env = IndexMap::new();
    env.insert("APP_CONFIGURATION".to_string(), "Prod".to_string());
    ExecutionContext::new(false).with_env(env)
}

proptest! {
    #[test]
    fn test_nested_scopes_restore_every_level(scopes in prop::collection::vec(arb_overrides(), 1..8)) {
        let mut ctx = seeded();
        let mut stack = Vec::new();

        for overrides in scopes {
            let before = ctx.snapshot();
            let token = ctx.push(overrides);
            stack.push((before, token));
        }
        prop_assert_eq!(ctx.depth(), stack.len());

        while let Some((before, token)) = stack.pop() {
            prop_assert!(ctx.pop(token).is_ok());
            prop_assert_eq!(ctx.snapshot(), before);
        }
        prop_assert_eq!(ctx.depth(), 0);
        prop_assert!(ctx.take_violation().is_none());
    }

    #[test]
    fn test_guards_restore_on_drop(outer in arb_overrides(), inner in arb_overrides()) {
        let mut ctx = seeded();
        let before = ctx.snapshot();
        {
            let mut guard = ctx.with_overrides(outer);
            let middle = guard.snapshot();
            {
                let _inner = guard.with_overrides(inner);
            }
            prop_assert_eq!(guard.snapshot(), middle);
        }
        prop_assert_eq!(ctx.snapshot(), before);
        prop_assert!(ctx.take_violation().is_none());
    }

    #[test]
    fn test_popping_outer_scope_first_is_violation(
        outer in arb_overrides(),
        inner in arb_overrides(),
    ) {
        let mut ctx = seeded();
        let before = ctx.snapshot();
        let outer_token = ctx.push(outer);
        let inner_token = ctx.push(inner);

        let leaked = ctx.pop(outer_token);
        let is_violation = matches!(leaked, Err(Error::ContextScopeViolation { .. }));
        prop_assert!(is_violation);
        // The outer pop unwinds everything it contained
        prop_assert_eq!(ctx.snapshot(), before);
        prop_assert_eq!(ctx.depth(), 0);

        let stale = ctx.pop(inner_token);
        let is_violation = matches!(stale, Err(Error::ContextScopeViolation { .. }));
        prop_assert!(is_violation);
    }
}

#[test]
fn test_env_override_shadows_and_restores() {
    let mut ctx = seeded();
    let token = ctx.push(Overrides::new().env("APP_CONFIGURATION", "Dev"));
    assert_eq!(ctx.get_env("APP_CONFIGURATION"), Some("Dev"));
    ctx.pop(token).unwrap();
    assert_eq!(ctx.get_env("APP_CONFIGURATION"), Some("Prod"));
}

#[test]
fn test_dry_run_flag_survives_scopes() {
    let mut ctx = ExecutionContext::new(true);
    let guard = ctx.with_overrides(Overrides::new().cwd("/srv"));
    assert!(guard.is_dry_run());
    drop(guard);
    assert!(ctx.is_dry_run());
}
