use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::{Map, Value, json};
use std::net::IpAddr;

use warden_auth::{Authenticator, Group, RequestContext, Registry, TokenPolicy, User};
use warden_core::GroupId;

fn identity() -> Map<String, Value> {
    match json!({"provider": "github", "id": "42", "name": "Ana", "mail": "ana@example.com"}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn ctx() -> RequestContext {
    RequestContext::new(IpAddr::from([10, 0, 0, 1]))
        .with_user_agent("bench")
        .with_session("s1")
}

fn bench_issue_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("token");
    group.throughput(Throughput::Elements(1));

    let policies = [
        ("signed", TokenPolicy::new().with_signing_key("k1")),
        ("signed_sealed", TokenPolicy::new().with_signing_key("k1").with_encryption_key("seal")),
    ];
    for (name, policy) in policies {
        let auth = Authenticator::new(policy);
        let ctx = ctx();

        group.bench_function(BenchmarkId::new("issue", name), |b| {
            b.iter(|| black_box(auth.issue(identity(), None, &ctx).unwrap()));
        });

        let raw = auth.issue(identity(), None, &ctx).unwrap();
        group.bench_function(BenchmarkId::new("verify", name), |b| {
            b.iter(|| black_box(auth.verify(&raw, &ctx).unwrap()));
        });
    }

    group.finish();
}

fn bench_permission_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("has_permission");

    for groups in [1usize, 10, 100].iter() {
        let mut registry = Registry::new(Vec::<Group>::new(), Vec::<String>::new());
        let mut user = User::new();
        for g in 0..*groups {
            let id = GroupId::new(format!("g{g}"));
            registry.save_group(
                Group::new(id.clone(), format!("Group {g}"))
                    .with_permissions((0..20).map(|p| format!("perm.{g}.{p}"))),
            );
            user.add_group(id);
        }
        registry.save_user(&mut user).unwrap();
        let needle = format!("perm.{}.19", groups - 1);

        group.bench_with_input(BenchmarkId::new("groups", groups), groups, |b, _| {
            b.iter(|| black_box(registry.has_permission(&user, &needle)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_issue_verify, bench_permission_checks);
criterion_main!(benches);
