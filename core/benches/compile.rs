//! Compile benchmarks: selector compilation and configuration digestion.
//!
//! Measures the one-time cost of turning selector strings and `.cdrl`
//! documents into their compiled forms.

use std::collections::BTreeMap;

use cedra::prelude::*;
use cedra::{ExpressionEvaluatorFactory, SelectorPath, NS_CDRL_20};

fn main() {
    divan::main();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Selector compilation
// ═══════════════════════════════════════════════════════════════════════════════

#[divan::bench]
fn compile_single_step(bencher: divan::Bencher) {
    let evaluators = ExpressionEvaluatorFactory::new();
    bencher.bench_local(|| SelectorPath::parse("order", &BTreeMap::new(), &evaluators).unwrap());
}

#[divan::bench]
fn compile_deep_path(bencher: divan::Bencher) {
    let evaluators = ExpressionEvaluatorFactory::new();
    bencher.bench_local(|| {
        SelectorPath::parse(
            "/envelope/body/orders/order/items/item/detail",
            &BTreeMap::new(),
            &evaluators,
        )
        .unwrap()
    });
}

#[divan::bench]
fn compile_predicated_path(bencher: divan::Bencher) {
    let evaluators = ExpressionEvaluatorFactory::new();
    bencher.bench_local(|| {
        SelectorPath::parse(
            "order/item[type = 'priority'][3]",
            &BTreeMap::new(),
            &evaluators,
        )
        .unwrap()
    });
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration digestion
// ═══════════════════════════════════════════════════════════════════════════════

fn config_with_resources(count: usize) -> String {
    let mut body = String::new();
    for i in 0..count {
        body.push_str(&format!(
            r#"<resource-config selector="order/item-{i}"><param name="n">{i}</param></resource-config>"#
        ));
    }
    format!(r#"<cedra-resource-list xmlns="{NS_CDRL_20}">{body}</cedra-resource-list>"#)
}

#[divan::bench(args = [1, 16, 128])]
fn digest_resources(bencher: divan::Bencher, count: usize) {
    let source = config_with_resources(count);
    let locator = InMemoryResourceLocator::new();
    bencher.bench_local(|| {
        let visitors = VisitorRegistry::builder().build();
        let mut extensions = ExtensionDigesters::new();
        digest_config(&source, "bench", &locator, &visitors, &mut extensions).unwrap()
    });
}
