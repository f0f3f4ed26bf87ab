//! Relationship loading: lookup counts, identity and cancellation.

mod common;

use common::{Car, CarOrder, CountingStore, Customer, Dealer, empty_store, registry};
use keel::prelude::*;
use std::time::Duration;

/// `n` dealers with two cars each, committed through one unit of work.
async fn dealership(n: usize) -> (CountingStore<SqliteStore>, Arc<SchemaRegistry>) {
    let registry = registry();
    let store = empty_store(&registry).await;

    let mut uow = UnitOfWork::new(store, Arc::clone(&registry));
    for i in 0..n {
        let dealer = uow
            .add(Dealer::new(&format!("Dealer {i}"), "Springfield"))
            .unwrap();
        for j in 0..2 {
            let car = uow
                .add(Car::new("Toyota", &format!("Model {i}-{j}"), 2020))
                .unwrap();
            uow.relate(&car, "dealer", &dealer).unwrap();
        }
    }
    uow.commit().await.unwrap();

    (CountingStore::new(uow.into_store()), registry)
}

async fn eager_load_lookups(n: usize) -> usize {
    let (store, registry) = dealership(n).await;
    let mut uow = UnitOfWork::new(store, registry);

    let dealers = uow.query::<Dealer>().all().await.unwrap();
    assert_eq!(dealers.len(), n);
    uow.store().reset();

    let reported = uow.load_eager(&dealers, "cars").await.unwrap();
    let issued = uow.store().queries();
    assert_eq!(reported, issued);

    for dealer in &dealers {
        let cars = uow.related::<Dealer, Car>(dealer, "cars").unwrap().unwrap();
        assert_eq!(cars.len(), 2);
    }
    issued
}

#[tokio::test]
async fn one_lookup_per_hop_regardless_of_parent_count() {
    for n in [0, 1, 50] {
        assert_eq!(eager_load_lookups(n).await, 1, "N = {n}");
    }
}

#[tokio::test]
async fn query_include_batches_every_hop() {
    let (store, registry) = dealership(10).await;
    let mut uow = UnitOfWork::new(store, registry);

    let cars = uow
        .query::<Car>()
        .include("dealer.cars")
        .all()
        .await
        .unwrap();
    assert_eq!(cars.len(), 20);
    // root query, dealers, then their cars
    assert_eq!(uow.store().queries(), 3);

    let dealers = uow.related::<Car, Dealer>(&cars[0], "dealer").unwrap().unwrap();
    let siblings = uow.related::<Dealer, Car>(&dealers[0], "cars").unwrap().unwrap();
    assert_eq!(siblings.len(), 2);
    assert!(siblings.iter().any(|c| Arc::ptr_eq(c, &cars[0])));
}

#[tokio::test]
async fn many_to_many_loads_through_the_join_in_one_lookup() {
    let registry = registry();
    let store = empty_store(&registry).await;

    let mut uow = UnitOfWork::new(store, Arc::clone(&registry));
    let customers: Vec<_> = (0..5)
        .map(|i| uow.add(Customer::new(&format!("Customer {i}"))).unwrap())
        .collect();
    let cars: Vec<_> = (0..3)
        .map(|i| uow.add(Car::new("Kia", &format!("Model {i}"), 2020)).unwrap())
        .collect();
    for customer in &customers {
        for car in &cars {
            let order = uow.add(CarOrder::unlinked()).unwrap();
            uow.relate(&order, "car", car).unwrap();
            uow.relate(&order, "customer", customer).unwrap();
        }
    }
    uow.commit().await.unwrap();

    let store = CountingStore::new(uow.into_store());
    let mut uow = UnitOfWork::new(store, registry);
    let customers = uow.query::<Customer>().all().await.unwrap();
    uow.store().reset();

    uow.load_eager(&customers, "cars").await.unwrap();
    assert_eq!(uow.store().queries(), 1);
    for customer in &customers {
        let owned = uow.related::<Customer, Car>(customer, "cars").unwrap().unwrap();
        assert_eq!(owned.len(), 3);
    }
}

#[tokio::test]
async fn tracked_edits_survive_reloading() {
    let (store, registry) = dealership(2).await;
    let mut uow = UnitOfWork::new(store, registry);

    let cars = uow.query::<Car>().order_by("id").all().await.unwrap();
    cars[0].write().unwrap().year = 2030;

    let again = uow.query::<Car>().order_by("id").all().await.unwrap();
    assert!(Arc::ptr_eq(&cars[0], &again[0]));
    assert_eq!(again[0].read().unwrap().year, 2030);
    assert_eq!(uow.pending().modified, 1);
}

#[tokio::test]
async fn on_demand_loading_needs_an_open_unit_of_work() {
    let (store, registry) = dealership(1).await;
    let mut uow = UnitOfWork::new(store, Arc::clone(&registry));
    let dealer = uow.query::<Dealer>().first().await.unwrap().unwrap();
    uow.commit().await.unwrap();

    let err = uow
        .load_on_demand::<Dealer, Car>(&dealer, "cars")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DetachedEntity { .. }));

    // an entity from another unit of work is not tracked here
    let mut other = UnitOfWork::new(uow.into_store(), registry);
    let err = other
        .load_on_demand::<Dealer, Car>(&dealer, "cars")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DetachedEntity { .. }));
}

#[tokio::test]
async fn unknown_relationship_is_reported_before_io() {
    let (store, registry) = dealership(1).await;
    let mut uow = UnitOfWork::new(store, registry);
    let dealers = uow.query::<Dealer>().all().await.unwrap();
    uow.store().reset();

    let err = uow.load_eager(&dealers, "showrooms").await.unwrap_err();
    assert!(matches!(err, Error::UnknownRelationship { .. }));
    assert_eq!(uow.store().queries(), 0);
}

#[tokio::test]
async fn load_cut_short_by_a_timeout_can_be_retried() {
    let (store, registry) = dealership(3).await;
    let mut uow = UnitOfWork::new(store.yielding(), registry);
    let dealers = uow.query::<Dealer>().all().await.unwrap();
    let tracked = uow.tracked_count();

    // the load is dropped while its first lookup is suspended
    let cut = tokio::time::timeout(Duration::ZERO, uow.load_eager(&dealers, "cars")).await;
    assert!(cut.is_err());
    assert_eq!(uow.tracked_count(), tracked);
    assert!(uow.related::<Dealer, Car>(&dealers[0], "cars").unwrap().is_none());

    uow.load_eager(&dealers, "cars").await.unwrap();
    assert_eq!(uow.tracked_count(), tracked + 6);
}
