//! Link fields through the engine: mirrors, key storage and exclusivity.

use cellflow_core::{CellValue, Field, FieldId, RecordId, Relationship, TableId};
use cellflow_engine::{Engine, EngineError, LinkSymmetricManager};

struct Fixture {
    engine: Engine,
    customers: TableId,
    orders: TableId,
    customer_name: FieldId,
    order_title: FieldId,
}

fn fixture() -> Fixture {
    let mut engine = Engine::in_memory().expect("failed to open in-memory engine");
    let customers = engine.create_table("Customers").unwrap();
    let orders = engine.create_table("Orders").unwrap();
    let primary = |engine: &Engine, table: &TableId| {
        engine.schema().table(table).unwrap().primary_field().unwrap().id.clone()
    };
    let customer_name = primary(&engine, &customers);
    let order_title = primary(&engine, &orders);
    Fixture {
        engine,
        customers,
        orders,
        customer_name,
        order_title,
    }
}

impl Fixture {
    fn link(&mut self, relationship: Relationship, one_way: bool) -> FieldId {
        let mut field = Field::link("Orders", relationship, self.orders.clone(), self.order_title.clone());
        if let Some(config) = field.link_config_mut() {
            config.is_one_way = one_way;
        }
        let id = field.id.clone();
        self.engine.create_field(&self.customers, field).unwrap();
        id
    }

    fn customer(&mut self, name: &str) -> RecordId {
        let values = vec![(self.customer_name.clone(), name.into())];
        self.engine.create_record(&self.customers, values).unwrap().0
    }

    fn order(&mut self, title: &str) -> RecordId {
        let values = vec![(self.order_title.clone(), title.into())];
        self.engine.create_record(&self.orders, values).unwrap().0
    }

    fn mirror_of(&self, link: &FieldId) -> FieldId {
        self.engine
            .schema()
            .field(link)
            .and_then(Field::link_config)
            .and_then(|config| config.symmetric_field_id())
            .cloned()
            .expect("link has a mirror")
    }
}

#[test]
fn two_way_link_creates_a_verified_mirror() {
    let mut fx = fixture();
    let link = fx.link(Relationship::ManyMany, false);
    let mirror = fx.mirror_of(&link);

    let orders = fx.engine.schema().table(&fx.orders).unwrap();
    let field = orders.field(&mirror).expect("mirror lives on the foreign table");
    assert_eq!(field.name, "Customers");
    let config = field.link_config().unwrap();
    assert_eq!(config.relationship, Relationship::ManyMany);
    assert_eq!(config.foreign_table_id, fx.customers);
    assert_eq!(config.symmetric_field_id(), Some(&link));

    let manager = LinkSymmetricManager::new(fx.engine.schema());
    manager.verify(&link).unwrap();
    manager.verify(&mirror).unwrap();
}

#[test]
fn one_way_link_has_no_mirror() {
    let mut fx = fixture();
    let before = fx.engine.schema().table(&fx.orders).unwrap().fields.len();
    let link = fx.link(Relationship::ManyMany, true);

    let config = fx.engine.schema().field(&link).unwrap().link_config().unwrap().clone();
    assert!(config.symmetric_field_id().is_none());
    assert!(config.db_config().is_some());
    assert_eq!(fx.engine.schema().table(&fx.orders).unwrap().fields.len(), before);
}

#[test]
fn setting_links_refreshes_both_sides() {
    let mut fx = fixture();
    let link = fx.link(Relationship::ManyMany, false);
    let mirror = fx.mirror_of(&link);
    let acme = fx.customer("Acme");
    let first = fx.order("first");
    let second = fx.order("second");

    let changes = fx
        .engine
        .set_link(&fx.customers, &acme, &link, vec![first.clone(), second.clone(), first.clone()])
        .unwrap();
    assert_eq!(fx.engine.linked_records(&link, &acme).unwrap(), vec![first.clone(), second.clone()]);

    let host = fx.engine.value(&fx.customers, &acme, &link).unwrap();
    assert_eq!(host.link_ids(), vec![first.clone(), second.clone()]);
    assert_eq!(host.display_string(), "first, second");

    let back = fx.engine.value(&fx.orders, &first, &mirror).unwrap();
    assert_eq!(back.link_ids(), vec![acme.clone()]);
    assert_eq!(back.display_string(), "Acme");
    assert!(changes.get(&fx.orders, &second, &mirror).is_some());

    fx.engine
        .set_link(&fx.customers, &acme, &link, vec![second.clone()])
        .unwrap();
    assert_eq!(fx.engine.value(&fx.orders, &first, &mirror).unwrap(), CellValue::Null);
}

#[test]
fn renaming_the_title_updates_link_displays() {
    let mut fx = fixture();
    let link = fx.link(Relationship::ManyMany, false);
    let acme = fx.customer("Acme");
    let first = fx.order("first");
    fx.engine
        .set_link(&fx.customers, &acme, &link, vec![first.clone()])
        .unwrap();

    let changes = fx
        .engine
        .update_record(&fx.orders, &first, vec![(fx.order_title.clone(), "renamed".into())])
        .unwrap();
    let change = changes.get(&fx.customers, &acme, &link).expect("display changed");
    assert_eq!(change.new_value.display_string(), "renamed");
}

#[test]
fn one_to_many_moves_a_foreign_record_to_its_new_host() {
    let mut fx = fixture();
    let link = fx.link(Relationship::OneMany, false);
    let mirror = fx.mirror_of(&link);
    let acme = fx.customer("Acme");
    let globex = fx.customer("Globex");
    let order = fx.order("first");

    fx.engine
        .set_link(&fx.customers, &acme, &link, vec![order.clone()])
        .unwrap();
    let changes = fx
        .engine
        .set_link(&fx.customers, &globex, &link, vec![order.clone()])
        .unwrap();

    assert!(fx.engine.linked_records(&link, &acme).unwrap().is_empty());
    assert_eq!(fx.engine.linked_records(&link, &globex).unwrap(), vec![order.clone()]);
    assert_eq!(fx.engine.value(&fx.customers, &acme, &link).unwrap(), CellValue::Null);
    assert!(changes.get(&fx.customers, &acme, &link).is_some());
    let back = fx.engine.value(&fx.orders, &order, &mirror).unwrap();
    assert_eq!(back.link_ids(), vec![globex]);
}

#[test]
fn single_links_reject_several_records() {
    let mut fx = fixture();
    let link = fx.link(Relationship::ManyOne, false);
    let acme = fx.customer("Acme");
    let first = fx.order("first");
    let second = fx.order("second");

    let err = fx
        .engine
        .set_link(&fx.customers, &acme, &link, vec![first.clone(), second])
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(_)), "{err}");

    fx.engine
        .set_link(&fx.customers, &acme, &link, vec![first.clone()])
        .unwrap();
    assert_eq!(fx.engine.linked_records(&link, &acme).unwrap(), vec![first]);
}

#[test]
fn linking_a_missing_record_is_not_found() {
    let mut fx = fixture();
    let link = fx.link(Relationship::ManyMany, false);
    let acme = fx.customer("Acme");
    let err = fx
        .engine
        .set_link(&fx.customers, &acme, &link, vec![RecordId::generate()])
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)), "{err}");
    assert!(fx.engine.linked_records(&link, &acme).unwrap().is_empty());
}

#[test]
fn deleting_a_link_removes_its_mirror() {
    let mut fx = fixture();
    let link = fx.link(Relationship::ManyMany, false);
    let mirror = fx.mirror_of(&link);
    let acme = fx.customer("Acme");
    let first = fx.order("first");
    fx.engine
        .set_link(&fx.customers, &acme, &link, vec![first])
        .unwrap();

    fx.engine.delete_field(&mirror).unwrap();
    assert!(fx.engine.schema().field(&mirror).is_none());
    assert!(fx.engine.schema().field(&link).is_none());
    fx.engine.reload_schema().unwrap();
    assert!(fx.engine.schema().field(&link).is_none());
}

#[test]
fn changing_the_title_field_keeps_existing_links() {
    let mut fx = fixture();
    let link = fx.link(Relationship::ManyMany, false);
    let code = Field::text("Code");
    let code_id = code.id.clone();
    fx.engine.create_field(&fx.orders, code).unwrap();
    let acme = fx.customer("Acme");
    let first = fx
        .engine
        .create_record(
            &fx.orders,
            vec![(fx.order_title.clone(), "first".into()), (code_id.clone(), "A-1".into())],
        )
        .unwrap()
        .0;
    fx.engine
        .set_link(&fx.customers, &acme, &link, vec![first.clone()])
        .unwrap();

    let kind = Field::link("Orders", Relationship::ManyMany, fx.orders.clone(), code_id).kind;
    fx.engine.convert_field(&link, kind).unwrap();
    assert_eq!(fx.engine.linked_records(&link, &acme).unwrap(), vec![first]);
    let display = fx.engine.value(&fx.customers, &acme, &link).unwrap();
    assert_eq!(display.display_string(), "A-1");
    LinkSymmetricManager::new(fx.engine.schema()).verify(&link).unwrap();
}

#[test]
fn self_link_mirrors_onto_the_same_table() {
    let mut fx = fixture();
    let field = Field::link(
        "Customers",
        Relationship::ManyMany,
        fx.customers.clone(),
        fx.customer_name.clone(),
    );
    let link = field.id.clone();
    fx.engine.create_field(&fx.customers, field).unwrap();
    let mirror = fx.mirror_of(&link);

    let customers = fx.engine.schema().table(&fx.customers).unwrap();
    assert_eq!(customers.field(&mirror).expect("mirror on the host table").name, "Customers 2");
    let manager = LinkSymmetricManager::new(fx.engine.schema());
    manager.verify(&link).unwrap();
    manager.verify(&mirror).unwrap();

    let acme = fx.customer("Acme");
    let globex = fx.customer("Globex");
    fx.engine
        .set_link(&fx.customers, &acme, &link, vec![globex.clone()])
        .unwrap();
    let forward = fx.engine.value(&fx.customers, &acme, &link).unwrap();
    assert_eq!(forward.link_ids(), vec![globex.clone()]);
    let back = fx.engine.value(&fx.customers, &globex, &mirror).unwrap();
    assert_eq!(back.link_ids(), vec![acme.clone()]);
    assert_eq!(back.display_string(), "Acme");
    assert_eq!(fx.engine.value(&fx.customers, &acme, &mirror).unwrap(), CellValue::Null);

    fx.engine.delete_field(&link).unwrap();
    assert!(fx.engine.schema().field(&link).is_none());
    assert!(fx.engine.schema().field(&mirror).is_none());
}
