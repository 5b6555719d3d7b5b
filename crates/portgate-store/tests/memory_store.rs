use portgate_proto::{password_digest, Client, Host, Mode, Tunnel};
use portgate_store::{Account, MemoryStore, Seed, Store, StoreError};

fn secret_task(password: &str) -> Tunnel {
    let mut task = Tunnel::new(0, 1, Mode::Secret);
    task.password = password.to_string();
    task
}

#[tokio::test]
async fn test_task_crud_assigns_ids() {
    let store = MemoryStore::new();
    let a = store.new_task(Tunnel::new(0, 1, Mode::Tcp)).await.unwrap();
    let b = store.new_task(Tunnel::new(0, 2, Mode::Udp)).await.unwrap();
    assert_eq!((a, b), (1, 2));

    let mut task = store.get_task(a).await.unwrap();
    task.remark = "ssh".into();
    task.run_status = true;
    store.update_task(&task).await.unwrap();

    let reloaded = store.get_task(a).await.unwrap();
    assert_eq!(reloaded.remark, "ssh");
    assert!(!reloaded.run_status, "run status must never be stored");

    assert_eq!(store.tasks_by_client(2).await.unwrap().len(), 1);

    store.del_task(a).await.unwrap();
    assert!(matches!(
        store.get_task(a).await,
        Err(StoreError::TaskNotFound(1))
    ));
    assert!(matches!(
        store.del_task(a).await,
        Err(StoreError::TaskNotFound(1))
    ));
}

#[tokio::test]
async fn test_secret_password_lookup_and_uniqueness() {
    let store = MemoryStore::new();
    let id = store.new_task(secret_task("hunter2")).await.unwrap();

    let found = store
        .task_by_password_md5(&password_digest("hunter2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, id);
    assert!(store
        .task_by_password_md5(&password_digest("other"))
        .await
        .unwrap()
        .is_none());

    assert!(matches!(
        store.new_task(secret_task("hunter2")).await,
        Err(StoreError::DuplicatePassword)
    ));
}

#[tokio::test]
async fn test_user_tasks_filters_account_and_client() {
    let store = MemoryStore::new();
    for (account, client) in [(7, 1), (7, 2), (8, 1)] {
        let mut task = Tunnel::new(0, client, Mode::Tcp);
        task.account_id = account;
        store.new_task(task).await.unwrap();
    }
    assert_eq!(store.user_tasks(7, None).await.unwrap().len(), 2);
    assert_eq!(store.user_tasks(7, Some(2)).await.unwrap().len(), 1);
    assert!(store.user_tasks(9, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_traffic_consumes_quota_and_clamps() {
    let store = MemoryStore::new();
    store.put_account(Account {
        id: 3,
        remark: String::new(),
        flow_kb: 10.0,
    });

    assert_eq!(store.account_flow_limit(3).await.unwrap(), 10 * 1024);

    store.add_traffic(3, -4.0).await.unwrap();
    assert_eq!(store.account_flow_limit(3).await.unwrap(), 6 * 1024);

    store.add_traffic(3, -100.0).await.unwrap();
    assert_eq!(store.account_flow_kb(3), Some(0.0));
    assert_eq!(store.account_flow_limit(3).await.unwrap(), 0);

    assert!(matches!(
        store.add_traffic(4, -1.0).await,
        Err(StoreError::AccountNotFound(4))
    ));
}

#[tokio::test]
async fn test_seeded_store_continues_ids() {
    let mut seed = Seed::default();
    seed.clients.push(Client::new(5, "key"));
    seed.tasks.push(Tunnel::new(40, 5, Mode::Tcp));
    seed.hosts.push(Host {
        id: 3,
        client_id: 5,
        host: "a.example.com".into(),
        ..Default::default()
    });
    let store = MemoryStore::from_seed(seed);

    assert_eq!(store.new_task(Tunnel::new(0, 5, Mode::Tcp)).await.unwrap(), 41);
    assert_eq!(store.new_client(Client::new(0, "k2")).await.unwrap(), 6);
    assert_eq!(store.hosts_by_client(5).await.unwrap().len(), 1);

    store.del_client(5).await.unwrap();
    assert!(matches!(
        store.get_client(5).await,
        Err(StoreError::ClientNotFound(5))
    ));
}
