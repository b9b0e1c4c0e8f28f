mod registry_watcher_tests;
