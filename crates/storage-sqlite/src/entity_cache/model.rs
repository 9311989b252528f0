use diesel::prelude::*;

/// One cached document. `collection` is the full path, so subcollection
/// entries under different parents never collide.
#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(primary_key(collection, entity_id))]
#[diesel(table_name = crate::schema::cached_entities)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CachedEntityDB {
    pub collection: String,
    pub entity_id: String,
    pub body: String,
    pub updated_at: String,
}
