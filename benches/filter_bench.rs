use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meshrelay::filter::{FilterAction, FilterChain, FilterRule, RuleKind};
use meshrelay::message::{EndpointId, FingerprintMode, InboundEvent, Message};

fn message(node: &str, text: &str) -> Message {
    Message::from_event(
        EndpointId::from("radio"),
        InboundEvent::text(1, node, 0, text),
        FingerprintMode::default(),
    )
}

fn bench_filter_chain(c: &mut Criterion) {
    let mut rules: Vec<FilterRule> = (0..50)
        .map(|i| {
            FilterRule::new(
                format!("keyword-{}", i),
                RuleKind::Keyword {
                    pattern: format!("spam{}", i),
                },
                FilterAction::Block,
                0,
            )
        })
        .collect();
    rules.push(FilterRule::new(
        "banned",
        RuleKind::NodeBlacklist {
            nodes: (0..100).map(|i| format!("!{:08x}", i)).collect(),
        },
        FilterAction::Block,
        10,
    ));
    rules.push(FilterRule::new(
        "ads",
        RuleKind::Regex {
            pattern: r"^(buy|sell)\s+\w+\s+now".into(),
        },
        FilterAction::Block,
        0,
    ));
    let chain = FilterChain::new(rules, FilterAction::Allow);

    let passes = message("!deadbeef", "meet at the trailhead at noon");
    let blocked_by_node = message("!00000010", "hello");
    let blocked_late = message("!deadbeef", "sell radios cheap now");

    c.bench_function("filter_evaluate_no_match", |b| {
        b.iter(|| chain.evaluate(black_box(&passes)))
    });

    c.bench_function("filter_evaluate_node_hit", |b| {
        b.iter(|| chain.evaluate(black_box(&blocked_by_node)))
    });

    c.bench_function("filter_evaluate_regex_hit", |b| {
        b.iter(|| chain.evaluate(black_box(&blocked_late)))
    });
}

criterion_group!(benches, bench_filter_chain);
criterion_main!(benches);
