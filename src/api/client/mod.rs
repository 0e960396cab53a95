mod sync;

pub(crate) use self::sync::sync_route;
