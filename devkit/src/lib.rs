/*!
# Perfdata DevKit - Mocks et utilitaires de test

Bibliothèque facilitant les tests du bridge perfdata avec:
- Un store Gnocchi mocké (réponses scriptables, appels enregistrés)
- Des builders de lignes et fichiers perfdata
- Un harness de spool pour les tests bout-en-bout
*/

pub mod mock_store;
pub mod perfdata_builder;
pub mod test_utils;

pub use mock_store::{MockStore, StoreCall};
pub use perfdata_builder::{PerfdataLine, SpoolFile};
pub use test_utils::SpoolHarness;
