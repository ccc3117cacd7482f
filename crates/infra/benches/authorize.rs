use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use latchkey_auth::{AuthorizationRequest, Group, Node, Policy, Statement, User};
use latchkey_infra::{AuthConfig, AuthService, CacheConfig, InMemoryAuthStore};

/// A user in one group, with `policies` policies attached through the group.
async fn seeded_service(cache: CacheConfig, policies: usize) -> AuthService {
    let config = AuthConfig {
        cache,
        ..AuthConfig::default()
    };
    let service = AuthService::new(Arc::new(InMemoryAuthStore::new()), &config).unwrap();
    service.create_user(User::new("alice")).await.unwrap();
    service.create_group(Group::new("readers")).await.unwrap();
    service.add_user_to_group("alice", "readers").await.unwrap();
    for i in 0..policies {
        let name = format!("policy-{i:04}");
        service
            .write_policy(Policy::new(
                name.as_str(),
                vec![Statement::allow(["fs:Read*"], format!("arn:lk:fs:::repository/repo-{i}/*"))],
            ))
            .await
            .unwrap();
        service.attach_policy_to_group(&name, "readers").await.unwrap();
    }
    service
}

fn bench_authorize(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("authorize");

    for policies in [1usize, 10, 100] {
        let request = AuthorizationRequest {
            username: "alice".into(),
            required_permissions: Node::permission("fs:ReadObject", "arn:lk:fs:::repository/repo-0/a"),
        };

        for (label, cache) in [("cached", CacheConfig::default()), ("uncached", CacheConfig::disabled())] {
            let service = runtime.block_on(seeded_service(cache, policies));
            group.bench_with_input(BenchmarkId::new(label, policies), &request, |b, request| {
                b.to_async(&runtime)
                    .iter(|| async { black_box(service.authorize(request).await.unwrap()) });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_authorize);
criterion_main!(benches);
